//! Blue/green traffic cutover on weighted listeners.
//!
//! A listener's default action is an ordered set of weighted target groups.
//! Releasing a deployment moves all traffic to its target group and keeps the
//! previously active groups in the set at weight zero, so they stay
//! registered until their own deployments are destroyed. Destroying a
//! deployment takes its group out again, deleting the listener when nothing
//! would be left.

use tracing::{debug, info, warn};

use crate::backend::{BackendAdapter, ListenerInfo, LoadBalancerInfo, LoadBalancing};
use crate::error::{ControlError, ControlResult};
use crate::provisioner::Provisioner;
use crate::types::{TargetReference, TrafficEntry};

/// New forwarding set after moving all traffic to `new_target`.
///
/// Entries that were receiving traffic are kept at weight zero; entries
/// already at zero are dropped. `new_target` appears exactly once, last,
/// at full weight.
#[must_use]
pub fn shift_weights(current: &[TargetReference], new_target: &str) -> Vec<TargetReference> {
    current
        .iter()
        .filter(|t| t.id != new_target && t.is_active())
        .map(|t| TargetReference::new(t.id.clone(), 0))
        .chain(std::iter::once(TargetReference::full(new_target)))
        .collect()
}

/// What taking a target group out of a listener requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// The group is not in the listener.
    NotPresent,
    /// The group was the only entry; the listener itself goes.
    DeleteListener,
    /// Write this set back.
    Rewrite(Vec<TargetReference>),
}

/// Plan the removal of `target` from a forwarding set.
///
/// If no remaining entry would receive traffic, the first remaining entry is
/// promoted to full weight.
#[must_use]
pub fn plan_removal(current: &[TargetReference], target: &str) -> Removal {
    if !current.iter().any(|t| t.id == target) {
        return Removal::NotPresent;
    }
    let mut remaining: Vec<TargetReference> =
        current.iter().filter(|t| t.id != target).cloned().collect();
    if remaining.is_empty() {
        return Removal::DeleteListener;
    }
    if !remaining.iter().any(TargetReference::is_active) {
        if let Some(first) = remaining.first_mut() {
            first.weight = TargetReference::FULL;
        }
    }
    Removal::Rewrite(remaining)
}

/// Where traffic is served from after a cutover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutoverResult {
    /// Listener now forwarding to the new target.
    pub listener: String,
    /// Load balancer owning the listener.
    pub load_balancer: String,
    /// Public DNS name of the load balancer.
    pub dns_name: String,
    /// Forwarding set written.
    pub default_action: Vec<TargetReference>,
}

/// Outcome of taking a target group out of its listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// Nothing referenced the group.
    Untouched,
    /// The group was removed and the rest written back.
    Rewritten,
    /// The listener was deleted.
    ListenerDeleted,
}

/// Applies cutovers through a backend's load balancing capability.
pub struct TrafficCutover<'a> {
    adapter: &'a dyn BackendAdapter,
    lb: &'a dyn LoadBalancing,
    provisioner: &'a Provisioner,
    port: u16,
}

impl<'a> TrafficCutover<'a> {
    /// Create a cutover manager for listeners on `port`.
    ///
    /// Fails with [`ControlError::Unsupported`] when the backend has no load
    /// balancing.
    pub fn new(
        adapter: &'a dyn BackendAdapter,
        provisioner: &'a Provisioner,
        port: u16,
    ) -> ControlResult<Self> {
        let lb = adapter
            .load_balancing()
            .ok_or_else(|| ControlError::unsupported(adapter.name(), "load balancing"))?;
        Ok(Self {
            adapter,
            lb,
            provisioner,
            port,
        })
    }

    /// Move all traffic to `new_target`.
    ///
    /// With no entry a load balancer named `lb_name` is created. A load
    /// balancer entry gets a listener unless one already exists on the
    /// port, in which case that listener is rewritten.
    pub async fn cutover(
        &self,
        entry: Option<&TrafficEntry>,
        new_target: &str,
        lb_name: &str,
    ) -> ControlResult<CutoverResult> {
        let classify = |e: &ControlError| self.adapter.classify_error(e);

        let (lb, listener) = match entry {
            None => {
                let lb = self
                    .provisioner
                    .mutate("create load balancer", classify, || {
                        self.lb.create_load_balancer(lb_name)
                    })
                    .await?;
                info!(load_balancer = %lb.id, "created load balancer");
                (lb, None)
            }
            Some(TrafficEntry::LoadBalancer(id)) => {
                let lb = self.load_balancer(id).await?;
                let listener = self.lb.find_listener(&lb.id, self.port).await?;
                if listener.is_some() {
                    debug!(load_balancer = %lb.id, port = self.port, "adopting existing listener");
                }
                (lb, listener)
            }
            Some(TrafficEntry::Listener(id)) => {
                let listener = self.lb.describe_listener(id).await?.ok_or_else(|| {
                    ControlError::fatal(format!("listener {id} not found"))
                })?;
                let lb = self.load_balancer(&listener.load_balancer).await?;
                (lb, Some(listener))
            }
        };

        let (listener, default_action) = match listener {
            None => {
                let action = vec![TargetReference::full(new_target)];
                let created = self
                    .provisioner
                    .mutate("create listener", classify, || {
                        self.lb.create_listener(&lb.id, self.port, &action)
                    })
                    .await?;
                info!(listener = %created.id, target = new_target, "created listener");
                (created.id, action)
            }
            Some(existing) => {
                let action = shift_weights(&existing.default_action, new_target);
                self.provisioner
                    .mutate("modify listener", classify, || {
                        self.lb.modify_listener(&existing.id, &action)
                    })
                    .await?;
                info!(
                    listener = %existing.id,
                    targets = %format_action(&action),
                    "shifted traffic"
                );
                (existing.id, action)
            }
        };

        Ok(CutoverResult {
            listener,
            load_balancer: lb.id,
            dns_name: lb.dns_name,
            default_action,
        })
    }

    /// Take `target` out of `listener`.
    ///
    /// A listener that no longer exists counts as already handled.
    pub async fn remove_target(&self, listener: &str, target: &str) -> ControlResult<RemovalOutcome> {
        let Some(info) = self.lb.describe_listener(listener).await? else {
            return Err(ControlError::already_absent(format!("listener {listener}")));
        };
        let classify = |e: &ControlError| self.adapter.classify_error(e);

        match plan_removal(&info.default_action, target) {
            Removal::NotPresent => {
                debug!(listener, target, "target not in listener");
                Ok(RemovalOutcome::Untouched)
            }
            Removal::DeleteListener => {
                self.provisioner
                    .mutate("delete listener", classify, || self.lb.delete_listener(listener))
                    .await?;
                info!(listener, "deleted listener with no remaining targets");
                Ok(RemovalOutcome::ListenerDeleted)
            }
            Removal::Rewrite(action) => {
                self.provisioner
                    .mutate("modify listener", classify, || {
                        self.lb.modify_listener(listener, &action)
                    })
                    .await?;
                info!(listener, targets = %format_action(&action), "removed target");
                Ok(RemovalOutcome::Rewritten)
            }
        }
    }

    /// Alias `hostname` in `zone` to the load balancer.
    ///
    /// Returns whether a record was created. An existing record is left
    /// alone; one pointing elsewhere is logged.
    pub async fn ensure_dns(
        &self,
        zone: &str,
        hostname: &str,
        load_balancer: &LoadBalancerInfo,
    ) -> ControlResult<bool> {
        if let Some(existing) = self.lb.find_dns_record(zone, hostname).await? {
            if existing.record_type != "A" || existing.target != load_balancer.dns_name {
                warn!(
                    hostname,
                    record_type = %existing.record_type,
                    target = %existing.target,
                    "existing DNS record does not point at the load balancer"
                );
            }
            return Ok(false);
        }

        let classify = |e: &ControlError| self.adapter.classify_error(e);
        self.provisioner
            .mutate("create dns alias", classify, || {
                self.lb.create_dns_alias(zone, hostname, load_balancer)
            })
            .await?;
        info!(hostname, target = %load_balancer.dns_name, "created DNS alias");
        Ok(true)
    }

    /// Look up a load balancer, failing if it does not exist.
    pub async fn load_balancer(&self, id: &str) -> ControlResult<LoadBalancerInfo> {
        self.lb
            .describe_load_balancer(id)
            .await?
            .ok_or_else(|| ControlError::fatal(format!("load balancer {id} not found")))
    }

    /// Look up a load balancer that may have been deleted out of band.
    pub async fn find_load_balancer(&self, id: &str) -> ControlResult<Option<LoadBalancerInfo>> {
        self.lb.describe_load_balancer(id).await
    }

    /// Look up a listener.
    pub async fn listener(&self, id: &str) -> ControlResult<Option<ListenerInfo>> {
        self.lb.describe_listener(id).await
    }
}

fn format_action(action: &[TargetReference]) -> String {
    action
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
