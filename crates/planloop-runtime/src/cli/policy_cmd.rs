//! `planloop policy` subcommands.

use std::io::Write;

use clap::Subcommand;
use planloop_core::Config;

#[derive(Subcommand, Debug)]
pub enum PolicyAction {
    /// Evaluate whether a role may call a tool
    Check {
        #[arg(short, long)]
        role: String,
        #[arg(short, long)]
        tool: String,
    },
    /// List the configured roles and their patterns
    Roles,
}

pub fn run(config: &Config, action: PolicyAction, out: &mut impl Write) -> anyhow::Result<()> {
    let policy = config.security.policy()?;
    match action {
        PolicyAction::Check { role, tool } => {
            let decision = policy.evaluate(&role, &tool);
            let verdict = if decision.allowed { "allowed" } else { "denied" };
            writeln!(out, "{role} -> {tool}: {verdict}")?;
            if let Some(pattern) = &decision.matched {
                writeln!(out, "  Matched: {pattern}")?;
            }
            writeln!(out, "  Reason:  {}", decision.reason)?;
        }
        PolicyAction::Roles => {
            if !policy.is_enforced() {
                writeln!(out, "Security disabled: every tool is allowed.")?;
            }
            for name in policy.role_names() {
                let Some(role) = policy.role(name) else {
                    continue;
                };
                writeln!(out, "{name}")?;
                writeln!(out, "  allow: {}", role.allow.join(", "))?;
                writeln!(out, "  deny:  {}", role.deny.join(", "))?;
            }
        }
    }
    Ok(())
}
