//! `skyport deploy`, `release`, `destroy` and `prune`.

use serde_json::json;
use skyport_control::teardown::TeardownReport;
use skyport_control::types::ServiceSpec;
use skyport_control::{AppName, DeploymentId, DeploymentRequest};

use super::Context;

/// Arguments for the deploy command.
pub struct DeployArgs {
    pub app: String,
    pub image: String,
    pub port: u16,
    pub env: Vec<(String, String)>,
    pub cpu: Option<u32>,
    pub memory: Option<u32>,
    pub replicas: Option<u32>,
    /// Release straight after a successful deploy.
    pub release: bool,
}

impl DeployArgs {
    fn into_request(self) -> DeploymentRequest {
        let mut spec = ServiceSpec::new(&self.app, self.image, self.port);
        for (key, value) in self.env {
            spec = spec.with_env(key, value);
        }
        let (cpu, memory) = (
            self.cpu.unwrap_or(spec.cpu),
            self.memory.unwrap_or(spec.memory_mb),
        );
        spec = spec.with_size(cpu, memory);
        if let Some(replicas) = self.replicas {
            spec = spec.with_replicas(replicas);
        }
        DeploymentRequest::new(self.app, spec)
    }
}

pub async fn deploy(ctx: &Context, args: DeployArgs) -> anyhow::Result<()> {
    let release = args.release;
    let manager = ctx.manager().await?;

    let record = manager.deploy(args.into_request()).await?;
    let id = record.data.id.clone();

    if !release {
        if ctx.json {
            return ctx.print_json(&record);
        }
        println!("Deployed {} as {}", record.data.app, id);
        if let Some(endpoint) = &record.data.public_endpoint {
            println!("  endpoint: {endpoint}");
        }
        println!("Release with: skyport release {id}");
        return Ok(());
    }

    let data = manager.release(&id).await?;
    if ctx.json {
        return ctx.print_json(&json!({ "deployment": record, "release": data }));
    }
    println!("Deployed and released {} as {}", record.data.app, id);
    println!("  url: {}", data.url);
    Ok(())
}

pub async fn release(ctx: &Context, id: &str) -> anyhow::Result<()> {
    let manager = ctx.manager().await?;
    let data = manager.release(&DeploymentId::new(id)).await?;

    if ctx.json {
        return ctx.print_json(&data);
    }
    println!("Released {id}");
    println!("  url: {}", data.url);
    Ok(())
}

pub async fn destroy(ctx: &Context, id: &str) -> anyhow::Result<()> {
    let manager = ctx.manager().await?;
    let report = manager.destroy(&DeploymentId::new(id)).await?;

    if ctx.json {
        return ctx.print_json(&report_json(&report));
    }
    println!("Destroyed {id}");
    print_report(&report);
    if !report.is_clean() {
        anyhow::bail!("{} resource(s) could not be deleted", report.failed.len());
    }
    Ok(())
}

pub async fn prune(ctx: &Context, app: &str, keep: Option<usize>) -> anyhow::Result<()> {
    let keep = keep.unwrap_or(ctx.config.release.retain);
    let manager = ctx.manager().await?;
    let report = manager.prune(&AppName::new(app), keep).await?;

    if ctx.json {
        let failed: Vec<_> = report
            .failed
            .iter()
            .map(|(id, error)| json!({ "id": id, "error": error }))
            .collect();
        return ctx.print_json(&json!({
            "kept": report.kept,
            "destroyed": report.destroyed,
            "failed": failed,
        }));
    }

    println!(
        "Kept {}, destroyed {} deployment(s) of {app}",
        report.kept.len(),
        report.destroyed.len()
    );
    for id in &report.destroyed {
        println!("  - {id}");
    }
    for (id, error) in &report.failed {
        println!("  ! {id}: {error}");
    }
    if !report.failed.is_empty() {
        anyhow::bail!("{} deployment(s) could not be destroyed", report.failed.len());
    }
    Ok(())
}

pub(super) fn report_json(report: &TeardownReport) -> serde_json::Value {
    json!({
        "deleted": report.deleted,
        "absent": report.absent,
        "skipped": report.skipped,
        "failed": report.failed,
    })
}

pub(super) fn print_report(report: &TeardownReport) {
    for step in &report.deleted {
        println!("  deleted  {step}");
    }
    for step in &report.absent {
        println!("  absent   {step}");
    }
    for step in &report.skipped {
        println!("  kept     {step}");
    }
    for step in &report.failed {
        println!("  FAILED   {step}");
    }
}
