// SPDX-License-Identifier: GPL-3.0-only

//! Fans each `MountStatus` out into one `VolumeMountStatus` per requester.

use std::collections::BTreeSet;

use anyhow::Context;
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_types::constants::LABEL_MOUNT_STATUS_ID;
use storage_types::{MountStatusSpec, VolumeMountStatusSpec};
use tracing::debug;

#[derive(Default)]
pub struct MountStatusController;

impl MountStatusController {
    pub const NAME: &'static str = "MountStatusController";

    pub fn new() -> Self {
        Self
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let mut wanted = BTreeSet::new();

        for mount_status in ctx.list::<MountStatusSpec>() {
            let id = mount_status.id().to_string();

            if mount_status.metadata.is_tearing_down() {
                if self.drain(ctx, &id)? {
                    ctx.remove_finalizer::<MountStatusSpec>(&id, Self::NAME)
                        .with_context(|| format!("failed to release mount status {}", id))?;
                }
                continue;
            }

            ctx.add_finalizer::<MountStatusSpec>(&id, Self::NAME)
                .with_context(|| format!("failed to hold mount status {}", id))?;

            let spec = &mount_status.spec;
            for (requester_id, requester) in spec.spec.requester_ids.iter().zip(&spec.spec.requesters) {
                let view = VolumeMountStatusSpec {
                    volume_id: spec.spec.volume_id.clone(),
                    requester: requester.clone(),
                    target: spec.target.clone(),
                    read_only: spec.read_only,
                };
                ctx.modify(requester_id, VolumeMountStatusSpec::default, |status| {
                    status.spec = view;
                    status
                        .metadata
                        .labels
                        .insert(LABEL_MOUNT_STATUS_ID.to_string(), id.clone());
                })
                .with_context(|| format!("failed to write volume mount status {}", requester_id))?;
                wanted.insert(requester_id.clone());
            }
        }

        for status in ctx.list::<VolumeMountStatusSpec>() {
            if wanted.contains(status.id()) {
                continue;
            }
            // statuses of a draining mount are handled above
            let draining = status
                .metadata
                .label(LABEL_MOUNT_STATUS_ID)
                .and_then(|owner| ctx.get::<MountStatusSpec>(owner))
                .is_some_and(|owner| owner.metadata.is_tearing_down());
            if draining {
                continue;
            }

            ctx.teardown_and_destroy::<VolumeMountStatusSpec>(status.id())
                .with_context(|| format!("failed to remove volume mount status {}", status.id()))?;
        }

        Ok(())
    }

    /// Tear down every view of mount `id`; true once all of them are gone.
    fn drain(&self, ctx: &ControllerContext, id: &str) -> anyhow::Result<bool> {
        let mut done = true;

        for status in ctx.list_labeled::<VolumeMountStatusSpec>(LABEL_MOUNT_STATUS_ID, id) {
            let gone = ctx
                .teardown_and_destroy::<VolumeMountStatusSpec>(status.id())
                .with_context(|| format!("failed to remove volume mount status {}", status.id()))?;
            if !gone {
                debug!("volume mount status {} is still in use", status.id());
                done = false;
            }
        }

        Ok(done)
    }
}

impl Controller for MountStatusController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::of::<MountStatusSpec>(), Input::of::<VolumeMountStatusSpec>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<VolumeMountStatusSpec>()]
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        while ctx.next_event() {
            self.reconcile(ctx)?;
            ctx.reset_restart_backoff();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storage_runtime::Store;
    use storage_testing::TestContext;
    use storage_types::MountRequestSpec;

    fn mounted(store: &Arc<Store>, requesters: &[(&str, &str)]) {
        store
            .modify("MountController", "u-data", MountStatusSpec::default, |m| {
                m.spec = MountStatusSpec {
                    spec: MountRequestSpec {
                        volume_id: "u-data".to_string(),
                        requesters: requesters.iter().map(|(_, r)| r.to_string()).collect(),
                        requester_ids: requesters.iter().map(|(id, _)| id.to_string()).collect(),
                        ..Default::default()
                    },
                    source: "/dev/sdb1".to_string(),
                    target: "/var/mnt/data".to_string(),
                    filesystem: "xfs".to_string(),
                    ..Default::default()
                }
            })
            .unwrap();
    }

    #[test]
    fn one_view_per_requester() {
        let store = Store::new();
        let test = TestContext::new(&store, MountStatusController::NAME);
        let mut controller = MountStatusController::new();
        mounted(&store, &[("a", "A"), ("b", "B")]);

        controller.reconcile(&test.ctx).unwrap();

        let a = store.get::<VolumeMountStatusSpec>("a").unwrap();
        assert_eq!(a.spec.requester, "A");
        assert_eq!(a.spec.target, "/var/mnt/data");
        assert_eq!(a.metadata.label(LABEL_MOUNT_STATUS_ID), Some("u-data"));
        assert!(store.get::<VolumeMountStatusSpec>("b").is_some());
        assert!(
            store
                .get::<MountStatusSpec>("u-data")
                .unwrap()
                .metadata
                .has_finalizer(MountStatusController::NAME)
        );

        mounted(&store, &[("a", "A")]);
        controller.reconcile(&test.ctx).unwrap();
        assert!(store.get::<VolumeMountStatusSpec>("b").is_none());
    }

    #[test]
    fn teardown_drains_the_views_first() {
        let store = Store::new();
        let test = TestContext::new(&store, MountStatusController::NAME);
        let mut controller = MountStatusController::new();
        mounted(&store, &[("a", "A")]);
        controller.reconcile(&test.ctx).unwrap();

        store
            .add_finalizer::<VolumeMountStatusSpec>("a", "A")
            .unwrap();
        store.teardown::<MountStatusSpec>("MountController", "u-data").unwrap();

        controller.reconcile(&test.ctx).unwrap();
        assert!(
            store
                .get::<VolumeMountStatusSpec>("a")
                .unwrap()
                .metadata
                .is_tearing_down()
        );
        assert!(!store.teardown::<MountStatusSpec>("MountController", "u-data").unwrap());

        store.remove_finalizer::<VolumeMountStatusSpec>("a", "A").unwrap();
        controller.reconcile(&test.ctx).unwrap();
        assert!(store.get::<VolumeMountStatusSpec>("a").is_none());
        assert!(store.teardown::<MountStatusSpec>("MountController", "u-data").unwrap());
    }
}
