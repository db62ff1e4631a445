// SPDX-License-Identifier: GPL-3.0-only

//! Turns the machine configuration into `VolumeConfig` documents and the
//! mount requests that go with them.
//!
//! Outputs no longer produced are torn down and destroyed once whoever holds
//! them lets go. On lifecycle teardown user volumes are withdrawn first;
//! `UserDiskConfigStatus.torn_down` reports when they are all gone.

use std::collections::BTreeSet;

use anyhow::Context;
use storage_runtime::{Controller, ControllerContext, Input, Output};
use storage_types::constants::{
    LABEL_EXISTING_VOLUME, LABEL_RAW_VOLUME, LABEL_SWAP_VOLUME, LABEL_USER_VOLUME,
    META_PARTITION_LABEL, META_TAG_STATE_ENCRYPTION_CONFIG, STATE_PARTITION_LABEL,
};
use storage_types::{
    PersistedEncryption, Resource, UserDiskConfigStatusSpec, VolumeConfigSpec,
    VolumeLifecycleSpec, VolumeMountRequestSpec, VolumePhase, VolumeStatusSpec,
};
use tracing::{debug, error, info, warn};

use crate::backends::Backends;
use crate::config::MachineConfig;
use crate::transform::{
    self, MountIntent, SYSTEM_TRANSFORMERS, TransformEnv, USER_TRANSFORMERS, VolumeResource,
};

const USER_LABELS: &[&str] = &[
    LABEL_USER_VOLUME,
    LABEL_RAW_VOLUME,
    LABEL_EXISTING_VOLUME,
    LABEL_SWAP_VOLUME,
];

fn is_user_volume<T>(resource: &Resource<T>) -> bool {
    USER_LABELS
        .iter()
        .any(|label| resource.metadata.label(label).is_some())
}

pub struct VolumeConfigController {
    backends: Backends,
    machine: Option<MachineConfig>,
    in_container: bool,
}

impl VolumeConfigController {
    pub const NAME: &'static str = "VolumeConfigController";

    pub fn new(backends: Backends, machine: Option<MachineConfig>, in_container: bool) -> Self {
        Self {
            backends,
            machine,
            in_container,
        }
    }

    /// Swap the machine configuration; applied on the next pass.
    pub fn set_machine(&mut self, machine: Option<MachineConfig>) {
        self.machine = machine;
    }

    /// Device of META once its volume is ready.
    fn meta_location(ctx: &ControllerContext) -> Option<String> {
        ctx.get::<VolumeStatusSpec>(META_PARTITION_LABEL)
            .filter(|status| status.spec.phase == VolumePhase::Ready)
            .map(|status| status.spec.location)
            .filter(|location| !location.is_empty())
    }

    fn read_state_encryption(&self, location: &str) -> Option<Vec<u8>> {
        match self
            .backends
            .meta
            .read_tag(location, META_TAG_STATE_ENCRYPTION_CONFIG)
        {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to read STATE encryption from META: {}", err);
                None
            }
        }
    }

    /// Bring the STATE encryption stored on META in line with the
    /// configuration, upgrading legacy documents on the way.
    fn persist_state_encryption(
        &self,
        location: &str,
        stored: Option<&[u8]>,
        state: Option<&VolumeResource>,
    ) {
        let stored = stored.filter(|bytes| !bytes.is_empty());

        let desired = match (&self.machine, state) {
            (Some(_), Some(state)) if state.spec.encryption.is_enabled() => {
                PersistedEncryption::from_spec(&state.spec.encryption).to_json()
            }
            (Some(_), _) if stored.is_some() => Ok(Vec::new()),
            (Some(_), _) => return,
            (None, _) => {
                let Some(bytes) = stored else {
                    return;
                };
                match PersistedEncryption::parse(bytes) {
                    Ok(persisted) if persisted.is_legacy() => persisted
                        .to_spec()
                        .and_then(|spec| PersistedEncryption::from_spec(&spec).to_json()),
                    _ => return,
                }
            }
        };

        let desired = match desired {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to encode STATE encryption: {:#}", err);
                return;
            }
        };

        if stored == Some(desired.as_slice()) {
            return;
        }

        match self
            .backends
            .meta
            .set_tag(location, META_TAG_STATE_ENCRYPTION_CONFIG, &desired)
        {
            Ok(true) => info!("STATE encryption config written to META"),
            Ok(false) => {}
            Err(err) => warn!("failed to write STATE encryption to META: {}", err),
        }
    }

    pub fn reconcile(&mut self, ctx: &ControllerContext) -> anyhow::Result<()> {
        let shutting_down = ctx
            .get::<VolumeLifecycleSpec>(VolumeLifecycleSpec::ID)
            .is_some_and(|lifecycle| lifecycle.metadata.is_tearing_down());

        let meta_location = Self::meta_location(ctx);
        let stored = meta_location
            .as_deref()
            .and_then(|location| self.read_state_encryption(location));

        let env = TransformEnv {
            machine: self.machine.as_ref(),
            in_container: self.in_container,
            meta_ready: meta_location.is_some(),
            state_encryption_meta: stored.as_deref(),
        };

        let mut resources = match transform::apply(&env, SYSTEM_TRANSFORMERS) {
            Ok(resources) => resources,
            Err(err) => {
                error!("invalid system volume configuration: {}", err);
                return Ok(());
            }
        };

        if let Some(location) = &meta_location
            && !self.in_container
        {
            let state = resources.iter().find(|r| r.id == STATE_PARTITION_LABEL);
            self.persist_state_encryption(location, stored.as_deref(), state);
        }

        let user_applied = self.machine.is_some() && !shutting_down;
        if user_applied {
            match transform::apply(&env, USER_TRANSFORMERS) {
                Ok(user) => resources.extend(user),
                Err(err) => {
                    error!("invalid user volume configuration: {}", err);
                    return Ok(());
                }
            }
        }

        let mut configs = BTreeSet::new();
        let mut requests = BTreeSet::new();

        for resource in resources {
            let VolumeResource {
                id,
                label,
                spec,
                mount,
            } = resource;

            match ctx.modify(&id, VolumeConfigSpec::default, |config| {
                config.metadata.labels.insert(label.to_string(), String::new());
                config.spec = spec;
            }) {
                Ok(_) => {}
                Err(err) if err.is_phase_conflict() => {
                    debug!("volume config {} is still tearing down", id);
                    continue;
                }
                Err(err) => return Err(err).with_context(|| format!("failed to write volume config {}", id)),
            }
            configs.insert(id.clone());

            if let MountIntent::Mount { read_only } = mount {
                let request = VolumeMountRequestSpec {
                    volume_id: id.clone(),
                    requester: Self::NAME.to_string(),
                    read_only,
                };
                match ctx.modify(&id, VolumeMountRequestSpec::default, |r| {
                    r.metadata.labels.insert(label.to_string(), String::new());
                    r.spec = request;
                }) {
                    Ok(_) => {
                        requests.insert(id);
                    }
                    Err(err) if err.is_phase_conflict() => {}
                    Err(err) => {
                        return Err(err).with_context(|| format!("failed to write mount request {}", id));
                    }
                }
            }
        }

        for request in ctx.list::<VolumeMountRequestSpec>() {
            if request.spec.requester != Self::NAME || requests.contains(request.id()) {
                continue;
            }
            if ctx
                .teardown_and_destroy::<VolumeMountRequestSpec>(request.id())
                .with_context(|| format!("failed to remove mount request {}", request.id()))?
            {
                debug!("mount request {} removed", request.id());
            }
        }

        for config in ctx.list::<VolumeConfigSpec>() {
            if configs.contains(config.id()) {
                continue;
            }
            if ctx
                .teardown_and_destroy::<VolumeConfigSpec>(config.id())
                .with_context(|| format!("failed to remove volume config {}", config.id()))?
            {
                info!("volume config {} removed", config.id());
            }
        }

        let user_left = ctx
            .list::<VolumeConfigSpec>()
            .iter()
            .any(is_user_volume);
        let torn_down = shutting_down && !user_left;

        ctx.modify(UserDiskConfigStatusSpec::ID, UserDiskConfigStatusSpec::default, |status| {
            status.spec.ready = user_applied;
            status.spec.torn_down = torn_down;
        })?;

        Ok(())
    }
}

impl Controller for VolumeConfigController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::id::<VolumeStatusSpec>(META_PARTITION_LABEL),
            Input::id::<VolumeLifecycleSpec>(VolumeLifecycleSpec::ID),
            Input::of::<VolumeConfigSpec>(),
            Input::of::<VolumeMountRequestSpec>(),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![
            Output::exclusive::<VolumeConfigSpec>(),
            Output::shared::<VolumeMountRequestSpec>(),
            Output::exclusive::<UserDiskConfigStatusSpec>(),
        ]
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        while ctx.next_event() {
            self.reconcile(ctx)?;
            ctx.reset_restart_backoff();
        }

        Ok(())
    }
}
