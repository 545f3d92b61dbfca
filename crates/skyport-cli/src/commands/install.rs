//! `skyport install`, `upgrade`, `uninstall` and `platforms`.

use anyhow::Context as _;
use serde_json::json;
use skyport_control::installer::Installation;
use skyport_control::{Installer, InstallerRegistry};

use super::deploy::{print_report, report_json};
use super::Context;

fn installer(ctx: &Context) -> anyhow::Result<Box<dyn Installer>> {
    InstallerRegistry::builtin()
        .resolve(ctx.config.platform.as_str(), &ctx.config, ctx.cancel.clone())
        .with_context(|| format!("preparing installer for {}", ctx.config.platform))
}

fn print_installation(ctx: &Context, verb: &str, installation: &Installation) -> anyhow::Result<()> {
    if ctx.json {
        return ctx.print_json(&json!({
            "platform": installation.platform,
            "service": installation.service,
            "endpoint": installation.endpoint,
            "outcome": installation.outcome.as_str(),
        }));
    }
    println!(
        "{verb} {} on {} ({})",
        installation.service,
        installation.platform,
        installation.outcome.as_str()
    );
    if let Some(endpoint) = &installation.endpoint {
        println!("  endpoint: {endpoint}");
    }
    Ok(())
}

pub async fn install(ctx: &Context) -> anyhow::Result<()> {
    let installation = installer(ctx)?.install().await?;
    print_installation(ctx, "Installed", &installation)
}

pub async fn upgrade(ctx: &Context) -> anyhow::Result<()> {
    let installation = installer(ctx)?.upgrade().await?;
    print_installation(ctx, "Upgraded", &installation)
}

pub async fn uninstall(ctx: &Context) -> anyhow::Result<()> {
    let installer = installer(ctx)?;
    let report = installer.uninstall().await?;

    if ctx.json {
        return ctx.print_json(&report_json(&report));
    }
    println!(
        "Uninstalled {} from {}",
        ctx.config.install.name,
        installer.platform()
    );
    print_report(&report);
    if !report.is_clean() {
        anyhow::bail!("{} resource(s) could not be deleted", report.failed.len());
    }
    Ok(())
}

pub fn platforms() {
    for platform in InstallerRegistry::builtin().platforms() {
        println!("{platform}");
    }
}
