//! `skyport status` and `skyport list`.

use serde_json::json;
use skyport_control::{AppName, DeploymentFilter, DeploymentId, DeploymentRecord, PersistedState};

use super::Context;

pub async fn status(ctx: &Context, id: &str) -> anyhow::Result<()> {
    let manager = ctx.manager().await?;
    let status = manager.status(&DeploymentId::new(id)).await?;

    if ctx.json {
        let live = status.live.as_ref().map(|s| {
            json!({
                "id": s.id,
                "image": s.image,
                "replicas": s.replicas,
                "cpu": s.cpu,
                "memory_mb": s.memory_mb,
                "running": s.running,
                "task_definition": s.task_definition,
            })
        });
        return ctx.print_json(&json!({ "deployment": status.record, "live": live }));
    }

    let data = &status.record.data;
    println!("Deployment {}", data.id);
    println!("  app:       {}", data.app);
    println!("  state:     {}", status.record.state);
    println!("  platform:  {} ({})", data.platform, data.region);
    println!("  image:     {}", data.spec.image);
    println!("  service:   {}", data.spec.name);
    println!("  created:   {}", data.created_at.to_rfc3339());
    if let Some(release) = &data.release {
        println!("  url:       {}", release.url);
    } else if let Some(endpoint) = &data.public_endpoint {
        println!("  endpoint:  {endpoint}");
    }
    if let Some(error) = &data.error {
        println!("  error:     {error}");
    }
    match &status.live {
        Some(live) => println!(
            "  live:      {} replica(s), {}",
            live.replicas,
            if live.running { "running" } else { "stopping" }
        ),
        None => println!("  live:      not found on {}", manager.adapter().name()),
    }
    Ok(())
}

pub async fn list(
    ctx: &Context,
    app: Option<String>,
    state: Option<PersistedState>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let mut filter = DeploymentFilter::new();
    if let Some(app) = app {
        filter = filter.with_app(AppName::new(app));
    }
    if let Some(state) = state {
        filter = filter.with_state(state);
    }
    if let Some(limit) = limit {
        filter = filter.with_limit(limit);
    }

    let manager = ctx.manager().await?;
    let records = manager.list(&filter).await?;

    if ctx.json {
        return ctx.print_json(&records);
    }
    if records.is_empty() {
        println!("No deployments");
        return Ok(());
    }
    println!("{:<26}  {:<16}  {:<10}  {:<20}  IMAGE", "ID", "APP", "STATE", "CREATED");
    for record in &records {
        println!("{}", row(record));
    }
    Ok(())
}

fn row(record: &DeploymentRecord) -> String {
    let data = &record.data;
    format!(
        "{:<26}  {:<16}  {:<10}  {:<20}  {}",
        data.id.as_str(),
        data.app.as_str(),
        record.state.as_str(),
        data.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        data.spec.image
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyport_control::types::ServiceSpec;
    use skyport_control::DeploymentData;

    #[test]
    fn row_is_aligned() {
        let data = DeploymentData::new(
            AppName::new("web"),
            "memory",
            "apps",
            ServiceSpec::new("web", "nginx:1.27", 80),
        );
        let record = DeploymentRecord::new(data);

        let line = row(&record);

        assert!(line.starts_with(record.data.id.as_str()));
        assert!(line.contains("  web  "));
        assert!(line.contains("pending"));
        assert!(line.ends_with("nginx:1.27"));
    }
}
