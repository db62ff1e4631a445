// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use storage_runtime::{Controller, ControllerContext, Input, Output, Runtime, Store};
use storage_types::resource_spec;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct Source {
    value: u64,
}

resource_spec!(Source, "Sources.test");

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct Mirror {
    value: u64,
}

resource_spec!(Mirror, "Mirrors.test");

/// Copies every `Source` into a `Mirror` of the same id.
struct MirrorController {
    runs: Arc<AtomicUsize>,
    fail_first: bool,
}

impl Controller for MirrorController {
    fn name(&self) -> &str {
        "MirrorController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::of::<Source>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<Mirror>()]
    }

    fn run(&mut self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 && self.fail_first {
            anyhow::bail!("first run fails");
        }

        while ctx.next_event() {
            for source in ctx.list::<Source>() {
                let value = source.spec.value;
                ctx.modify(source.id(), Mirror::default, |m| m.spec.value = value)?;
            }
            ctx.reset_restart_backoff();
        }

        Ok(())
    }
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn controllers_react_to_inputs_and_stop() {
    let store = Store::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let mut runtime = Runtime::new(store.clone());
    runtime
        .register(Box::new(MirrorController {
            runs: runs.clone(),
            fail_first: false,
        }))
        .unwrap();
    let handle = runtime.start().unwrap();

    store.modify("test", "a", Source::default, |s| s.spec.value = 1).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        store.get::<Mirror>("a").is_some_and(|m| m.spec.value == 1)
    }));

    store.modify("test", "a", Source::default, |s| s.spec.value = 2).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        store.get::<Mirror>("a").is_some_and(|m| m.spec.value == 2)
    }));

    // only the controller may write its exclusive output
    assert!(store.modify("test", "a", Mirror::default, |m| m.spec.value = 9).is_err());

    handle.stop();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_controller_is_restarted() {
    let store = Store::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let mut runtime = Runtime::new(store.clone());
    runtime
        .register(Box::new(MirrorController {
            runs: runs.clone(),
            fail_first: true,
        }))
        .unwrap();
    let handle = runtime.start().unwrap();

    store.modify("test", "b", Source::default, |s| s.spec.value = 3).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        store.get::<Mirror>("b").is_some_and(|m| m.spec.value == 3)
    }));
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    handle.stop();
}

#[test]
fn two_controllers_cannot_share_an_exclusive_output() {
    let store = Store::new();
    let mut runtime = Runtime::new(store);
    let runs = Arc::new(AtomicUsize::new(0));

    runtime
        .register(Box::new(MirrorController {
            runs: runs.clone(),
            fail_first: false,
        }))
        .unwrap();

    struct Impostor;
    impl Controller for Impostor {
        fn name(&self) -> &str {
            "Impostor"
        }
        fn inputs(&self) -> Vec<Input> {
            Vec::new()
        }
        fn outputs(&self) -> Vec<Output> {
            vec![Output::exclusive::<Mirror>()]
        }
        fn run(&mut self, _ctx: &mut ControllerContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    assert!(runtime.register(Box::new(Impostor)).is_err());
}
