// SPDX-License-Identifier: GPL-3.0-only

//! Folds the `VolumeMountRequest`s of every ready volume into one
//! `MountRequest` per volume.

use std::collections::BTreeMap;

use anyhow::Context;
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_types::{
    MountRequestSpec, Resource, VolumeMountRequestSpec, VolumePhase, VolumeStatusSpec,
};
use tracing::debug;

#[derive(Default)]
pub struct MountRequestController;

impl MountRequestController {
    pub const NAME: &'static str = "MountRequestController";

    pub fn new() -> Self {
        Self
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let mut requests = ctx.list::<VolumeMountRequestSpec>();
        requests.sort_by(|a, b| a.id().cmp(b.id()));

        let mut desired: BTreeMap<String, MountRequestSpec> = BTreeMap::new();
        let mut released = Vec::new();

        for request in &requests {
            if request.metadata.is_tearing_down() {
                released.push(request.id().to_string());
                continue;
            }

            let Some(status) = ctx
                .get::<VolumeStatusSpec>(&request.spec.volume_id)
                .filter(|status| status.metadata.is_running())
                .filter(|status| status.spec.phase == VolumePhase::Ready)
            else {
                continue;
            };

            ctx.add_finalizer::<VolumeMountRequestSpec>(request.id(), Self::NAME)
                .with_context(|| format!("failed to hold volume mount request {}", request.id()))?;

            let entry = desired
                .entry(request.spec.volume_id.clone())
                .or_insert_with(|| MountRequestSpec {
                    volume_id: request.spec.volume_id.clone(),
                    read_only: true,
                    parent_mount_id: status.spec.mount_spec.parent_id.clone(),
                    ..Default::default()
                });
            entry.requesters.push(request.spec.requester.clone());
            entry.requester_ids.push(request.id().to_string());
            entry.read_only &= request.spec.read_only;
        }

        for (id, spec) in &desired {
            if ctx
                .get::<MountRequestSpec>(id)
                .is_some_and(|existing: Resource<MountRequestSpec>| existing.metadata.is_tearing_down())
            {
                // recreated once the old one is gone
                continue;
            }

            let spec = spec.clone();
            ctx.modify(id, MountRequestSpec::default, |request| request.spec = spec)
                .with_context(|| format!("failed to write mount request {}", id))?;
        }

        for existing in ctx.list::<MountRequestSpec>() {
            if desired.contains_key(existing.id()) && existing.metadata.is_running() {
                continue;
            }

            if ctx
                .teardown_and_destroy::<MountRequestSpec>(existing.id())
                .with_context(|| format!("failed to remove mount request {}", existing.id()))?
            {
                debug!("mount request {} removed", existing.id());
            }
        }

        for id in released {
            ctx.remove_finalizer::<VolumeMountRequestSpec>(&id, Self::NAME)
                .with_context(|| format!("failed to release volume mount request {}", id))?;
        }

        Ok(())
    }
}

impl Controller for MountRequestController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::of::<VolumeMountRequestSpec>(),
            Input::of::<VolumeStatusSpec>(),
            Input::of::<MountRequestSpec>(),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<MountRequestSpec>()]
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
    use storage_types::MountSpec;

    fn ready(store: &Store, id: &str) {
        store
            .modify("VolumeManagerController", id, VolumeStatusSpec::default, |status| {
                status.spec.phase = VolumePhase::Ready;
                status.spec.mount_spec = MountSpec {
                    target_path: "/var/mnt/data".to_string(),
                    parent_id: "EPHEMERAL".to_string(),
                    ..Default::default()
                };
            })
            .unwrap();
    }

    fn request(store: &Store, id: &str, requester: &str, read_only: bool) {
        store
            .modify(requester, id, VolumeMountRequestSpec::default, |r| {
                r.spec = VolumeMountRequestSpec {
                    volume_id: "u-data".to_string(),
                    requester: requester.to_string(),
                    read_only,
                }
            })
            .unwrap();
    }

    fn setup() -> (Arc<Store>, TestContext) {
        let store = Store::new();
        let test = TestContext::new(&store, MountRequestController::NAME);
        (store, test)
    }

    #[test]
    fn read_only_only_when_every_requester_asks() {
        let (store, test) = setup();
        let mut controller = MountRequestController::new();
        ready(&store, "u-data");
        request(&store, "a", "A", true);
        request(&store, "b", "B", false);

        controller.reconcile(&test.ctx).unwrap();
        let aggregated = store.get::<MountRequestSpec>("u-data").unwrap().spec;
        assert!(!aggregated.read_only);
        assert_eq!(aggregated.requesters, ["A", "B"]);
        assert_eq!(aggregated.requester_ids, ["a", "b"]);
        assert_eq!(aggregated.parent_mount_id, "EPHEMERAL");

        store.teardown::<VolumeMountRequestSpec>("B", "b").unwrap();
        controller.reconcile(&test.ctx).unwrap();
        let aggregated = store.get::<MountRequestSpec>("u-data").unwrap().spec;
        assert!(aggregated.read_only);
        assert_eq!(aggregated.requesters, ["A"]);
        // the torn down request was let go
        assert!(store.destroy::<VolumeMountRequestSpec>("B", "b").is_ok());

        request(&store, "c", "C", false);
        controller.reconcile(&test.ctx).unwrap();
        assert!(!store.get::<MountRequestSpec>("u-data").unwrap().spec.read_only);
    }

    #[test]
    fn volumes_that_are_not_ready_get_no_request() {
        let (store, test) = setup();
        request(&store, "a", "A", false);

        MountRequestController::new().reconcile(&test.ctx).unwrap();
        assert!(store.get::<MountRequestSpec>("u-data").is_none());
        let vmr = store.get::<VolumeMountRequestSpec>("a").unwrap();
        assert!(vmr.metadata.finalizers.is_empty());
    }

    #[test]
    fn last_requester_gone_removes_the_request() {
        let (store, test) = setup();
        let mut controller = MountRequestController::new();
        ready(&store, "u-data");
        request(&store, "a", "A", false);
        controller.reconcile(&test.ctx).unwrap();

        store
            .add_finalizer::<MountRequestSpec>("u-data", "MountController")
            .unwrap();
        store.teardown::<VolumeMountRequestSpec>("A", "a").unwrap();
        controller.reconcile(&test.ctx).unwrap();

        let aggregated = store.get::<MountRequestSpec>("u-data").unwrap();
        assert!(aggregated.metadata.is_tearing_down());

        store
            .remove_finalizer::<MountRequestSpec>("u-data", "MountController")
            .unwrap();
        controller.reconcile(&test.ctx).unwrap();
        assert!(store.get::<MountRequestSpec>("u-data").is_none());
    }

    #[test]
    fn status_teardown_withdraws_the_request() {
        let (store, test) = setup();
        let mut controller = MountRequestController::new();
        ready(&store, "u-data");
        request(&store, "a", "A", false);
        controller.reconcile(&test.ctx).unwrap();

        store
            .teardown::<VolumeStatusSpec>("VolumeManagerController", "u-data")
            .unwrap();
        controller.reconcile(&test.ctx).unwrap();
        assert!(store.get::<MountRequestSpec>("u-data").is_none());
    }
}
