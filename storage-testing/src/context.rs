// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use storage_runtime::{ControllerContext, Store};

/// A controller context wired to channels the test holds on to.
///
/// Controllers expose their reconcile passes as plain methods; tests call
/// them with `ctx` instead of spinning up a runtime.
pub struct TestContext {
    pub ctx: ControllerContext,
    events: Sender<()>,
    done: Option<Sender<()>>,
}

impl TestContext {
    pub fn new(store: &Arc<Store>, name: &str) -> Self {
        let (events, events_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);
        let (done, done_rx) = crossbeam_channel::bounded(0);

        Self {
            ctx: ControllerContext::new(name, store.clone(), events_rx, done_rx),
            events,
            done: Some(done),
        }
    }

    /// Queue a wake-up, as a store write to a watched input would.
    pub fn wake(&self) {
        let _ = self.events.try_send(());
    }

    /// Simulate runtime shutdown.
    pub fn cancel(&mut self) {
        self.done.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_disconnects_done() {
        let store = Store::new();
        let mut test = TestContext::new(&store, "TestController");
        assert!(!test.ctx.is_cancelled());

        test.wake();
        assert!(test.ctx.next_event());

        test.cancel();
        assert!(test.ctx.is_cancelled());
        assert!(!test.ctx.next_event());
    }
}
