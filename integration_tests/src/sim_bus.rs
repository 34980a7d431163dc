use std::sync::{Arc, Mutex};

use tincan_node::{
    can_module::ErrorCounters,
    common::{CanId, CanMessage},
    CanLink, CanModule,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// A CAN bus connecting the dispatch cores of several nodes and any number of listeners
#[derive(Clone, Default)]
pub struct SimBus<'a> {
    modules: Arc<Mutex<Vec<&'a CanModule<'a>>>>,
    // Channels to listeners which are not nodes, e.g. a test watching the bus
    external_channels: Arc<Mutex<Vec<UnboundedSender<CanMessage>>>>,
}

impl<'a> SimBus<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node's dispatch core, returning the link it transmits through
    pub fn add_node(&mut self, can: &'a CanModule<'a>) -> SimLink<'a> {
        let mut modules = self.modules.lock().unwrap();
        let index = modules.len();
        modules.push(can);
        SimLink {
            index,
            bus: self.clone(),
            busy: false,
            errors: ErrorCounters::default(),
            filters: Vec::new(),
        }
    }

    pub fn new_receiver(&mut self) -> SimBusReceiver {
        let (tx, rx) = unbounded_channel();
        self.external_channels.lock().unwrap().push(tx);
        SimBusReceiver { channel_rx: rx }
    }

    pub fn new_sender(&mut self) -> SimBusSender<'a> {
        SimBusSender { bus: self.clone() }
    }

    fn deliver(&self, msg: CanMessage, skip: Option<usize>) {
        // Collect first, so the lock is not held while handlers run
        let modules: Vec<_> = self.modules.lock().unwrap().clone();
        for (i, can) in modules.iter().enumerate() {
            if Some(i) != skip {
                can.on_frame_received(&msg);
            }
        }
        for ext in self.external_channels.lock().unwrap().iter() {
            // A listener may have been dropped already
            let _ = ext.send(msg);
        }
    }
}

/// The controller of one simulated node
pub struct SimLink<'a> {
    index: usize,
    bus: SimBus<'a>,
    busy: bool,
    errors: ErrorCounters,
    filters: Vec<(usize, u16, u16)>,
}

impl SimLink<'_> {
    /// A busy controller refuses every frame
    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    pub fn set_error_counters(&mut self, errors: ErrorCounters) {
        self.errors = errors;
    }

    /// The hardware filters programmed so far, as (slot, ident, mask)
    pub fn filters(&self) -> &[(usize, u16, u16)] {
        &self.filters
    }
}

impl CanLink for SimLink<'_> {
    fn send_frame(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        if self.busy {
            return Err(msg);
        }
        // Nodes do not receive their own frames
        self.bus.deliver(msg, Some(self.index));
        Ok(())
    }

    fn set_filter(&mut self, slot: usize, ident: u16, mask: u16) {
        self.filters.retain(|f| f.0 != slot);
        self.filters.push((slot, ident, mask));
    }

    fn error_counters(&self) -> ErrorCounters {
        self.errors
    }
}

/// Puts frames on the bus from outside any node
pub struct SimBusSender<'a> {
    bus: SimBus<'a>,
}

impl SimBusSender<'_> {
    pub fn send(&mut self, msg: CanMessage) {
        self.bus.deliver(msg, None);
    }

    pub fn send_std(&mut self, id: u16, data: &[u8]) {
        self.send(CanMessage::new(CanId::std(id), data));
    }
}

pub struct SimBusReceiver {
    channel_rx: UnboundedReceiver<CanMessage>,
}

impl SimBusReceiver {
    pub fn try_recv(&mut self) -> Option<CanMessage> {
        self.channel_rx.try_recv().ok()
    }

    pub async fn recv(&mut self) -> Option<CanMessage> {
        self.channel_rx.recv().await
    }

    pub fn flush(&mut self) {
        while self.channel_rx.try_recv().is_ok() {}
    }

    /// Drain the received frames with identifier `id`, dropping the others
    pub fn take_with_id(&mut self, id: u16) -> Vec<CanMessage> {
        let mut frames = Vec::new();
        while let Some(msg) = self.try_recv() {
            if msg.id() == CanId::std(id) {
                frames.push(msg);
            }
        }
        frames
    }
}
