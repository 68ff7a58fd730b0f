//! ISO-TP channel bound to a pair of broker signals
//!
//! A [TransportChannel] publishes requests on its send signal and reassembles whatever arrives
//! on its receive signal. Receiving happens on a background worker thread which is started by
//! [TransportChannel::open] and joined by [TransportChannel::close] (or when the channel is dropped).
//!
//! Flow control frames seen by the worker are forwarded to the thread currently sending, every
//! other frame goes to the channel's [ReceiveReassembler].

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use crate::{
    broker::{SignalBroker, Subscription},
    config::ChannelConfig,
    flow_control::{FlowControlFrame, FlowControlPolicy, FlowStatus},
    frame::{encode_single_frame, FrameType},
    reassembler::{ReceiveReassembler, RxEvent, RxState},
    send_session::{take_pending_flow_control, FlowControlSource, LocalFlowControl, SendSession},
    ProtocolViolation, TimeoutKind, TransportError, TransportResult,
};

/// How long the receive worker blocks on its subscription before checking timers
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Flow control frames buffered between the receive worker and the sending thread
const FLOW_CONTROL_QUEUE_LEN: usize = 16;

type FlowControlResult = TransportResult<FlowControlFrame>;

#[derive(Debug)]
struct RxShared {
    reassembler: ReceiveReassembler,
    completed: Option<Vec<u8>>,
    last_error: Option<TransportError>,
    pending_flow_control: Option<FlowStatus>,
}

/// State shared between the channel handle and its receive worker
#[derive(Debug)]
struct ChannelInner {
    broker: Arc<dyn SignalBroker>,
    config: ChannelConfig,
    running: AtomicBool,
    tx_active: AtomicBool,
    rx: Mutex<RxShared>,
    message_ready: Condvar,
    policy: Mutex<FlowControlPolicy>,
    fc_sender: mpsc::SyncSender<FlowControlResult>,
}

impl ChannelInner {
    fn lock_rx(&self) -> MutexGuard<'_, RxShared> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn policy(&self) -> FlowControlPolicy {
        *self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn publish(&self, frame: &[u8]) -> TransportResult<()> {
        if !self.is_running() {
            return Err(TransportError::ChannelClosed);
        }
        self.broker
            .publish(&self.config.send_signal, frame)
            .inspect_err(|e| error!("[{}] Publish failed: {e}", self.config.name))
    }

    fn publish_flow_control(&self, fc: &FlowControlFrame) -> TransportResult<()> {
        let bytes = fc.to_bytes(
            self.config.max_frame_length,
            self.config.frame_settings().padding(),
        );
        debug!("[{}] TX FC {bytes:02X?}", self.config.name);
        self.publish(&bytes)
    }

    fn on_frame_received(&self, frame: &[u8]) {
        debug!("[{}] RX {frame:02X?}", self.config.name);
        if frame.first().map(|b| b >> 4) == Some(FrameType::FlowControl as u8) {
            self.route_flow_control(frame);
            return;
        }

        let policy = self.policy();
        let mut rx = self.lock_rx();
        match rx.reassembler.on_frame(frame) {
            Ok(RxEvent::None) => {}
            Ok(RxEvent::Completed) => {
                if let Some(msg) = rx.reassembler.take_message() {
                    if rx.completed.is_some() {
                        warn!(
                            "[{}] Replacing a completed message nobody collected",
                            self.config.name
                        );
                    }
                    rx.completed = Some(msg);
                    self.message_ready.notify_all();
                }
            }
            Ok(RxEvent::FlowControl(FlowStatus::Overflow)) => {
                // A refused message is always answered, regardless of the policy
                let fc = policy.with_flag(FlowStatus::Overflow);
                if let Err(e) = self.publish_flow_control(&fc) {
                    rx.last_error = Some(e);
                }
                rx.last_error = Some(TransportError::PayloadTooLarge {
                    len: rx.reassembler.expected_total_length(),
                    max: self.config.max_message_length,
                });
            }
            Ok(RxEvent::FlowControl(flag)) => {
                if !policy.frame_control_auto {
                    debug!("[{}] {flag} flow control due, left to the caller", self.config.name);
                    rx.pending_flow_control = Some(flag);
                    return;
                }
                let fc = policy.to_frame();
                match self.publish_flow_control(&fc) {
                    Ok(()) => {
                        rx.reassembler.on_flow_control_sent(&fc);
                        if fc.flag == FlowStatus::Overflow {
                            rx.reassembler.clear();
                        }
                    }
                    Err(e) => rx.last_error = Some(e),
                }
            }
            Err(e) => rx.last_error = Some(e),
        }
    }

    fn route_flow_control(&self, frame: &[u8]) {
        let fc = FlowControlFrame::interpret(frame);
        if !self.tx_active.load(Ordering::Acquire) {
            warn!(
                "[{}] Flow control {frame:02X?} received, but nothing is being sent",
                self.config.name
            );
            self.lock_rx().last_error = Some(ProtocolViolation::UnexpectedFlowControl.into());
            return;
        }
        if let Err(mpsc::TrySendError::Full(_)) = self.fc_sender.try_send(fc) {
            warn!("[{}] Flow control queue full, dropping {frame:02X?}", self.config.name);
        }
    }

    fn check_timeout(&self) {
        let mut rx = self.lock_rx();
        if let Err(e) = rx.reassembler.check_timeout(self.config.timing.n_cr) {
            rx.last_error = Some(e);
        }
    }
}

fn receive_worker(inner: Arc<ChannelInner>, subscription: Subscription) {
    debug!("[{}] Receive worker started", inner.config.name);
    while inner.is_running() {
        match subscription.recv_timeout(WORKER_POLL_INTERVAL) {
            Ok(frame) => inner.on_frame_received(&frame),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                debug!("[{}] Subscription ended", inner.config.name);
                break;
            }
        }
        inner.check_timeout();
    }
    debug!("[{}] Receive worker stopped", inner.config.name);
}

/// Flow control forwarded by the receive worker, for as long as the channel stays open
struct WorkerFlowControl<'a> {
    queue: &'a mpsc::Receiver<FlowControlResult>,
    inner: &'a ChannelInner,
}

impl FlowControlSource for WorkerFlowControl<'_> {
    fn next_flow_control(&mut self, timeout: Duration) -> TransportResult<FlowControlFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.inner.is_running() {
                return Err(TransportError::ChannelClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::ChannelTimeout(TimeoutKind::FlowControl));
            }
            match self.queue.recv_timeout(WORKER_POLL_INTERVAL.min(deadline - now)) {
                Ok(fc) => return fc,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::ChannelClosed);
                }
            }
        }
    }

    fn take_pending(&mut self) -> Option<FlowControlFrame> {
        take_pending_flow_control(self.queue)
    }
}

/// ISO-TP transport over one send/receive signal pair
#[derive(Debug)]
pub struct TransportChannel {
    inner: Arc<ChannelInner>,
    // Held for the whole of a send, so only one transmission is in flight
    fc_queue: Mutex<mpsc::Receiver<FlowControlResult>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransportChannel {
    /// Validates `config`, subscribes to the receive signal and starts the receive worker
    pub fn open(broker: Arc<dyn SignalBroker>, config: ChannelConfig) -> TransportResult<Self> {
        config.validate()?;
        let subscription = broker.subscribe(&config.receive_signal)?;
        let (fc_sender, fc_queue) = mpsc::sync_channel(FLOW_CONTROL_QUEUE_LEN);
        let policy = config.flow_control;
        let inner = Arc::new(ChannelInner {
            rx: Mutex::new(RxShared {
                reassembler: ReceiveReassembler::new(config.max_message_length, policy.block_size),
                completed: None,
                last_error: None,
                pending_flow_control: None,
            }),
            broker,
            config,
            running: AtomicBool::new(true),
            tx_active: AtomicBool::new(false),
            message_ready: Condvar::new(),
            policy: Mutex::new(policy),
            fc_sender,
        });

        let worker_inner = inner.clone();
        let worker = thread::Builder::new()
            .name(format!("isotp-rx-{}", inner.config.name))
            .spawn(move || receive_worker(worker_inner, subscription))
            .map_err(|e| {
                TransportError::Broker(format!("could not start the receive worker: {e}"))
            })?;

        debug!(
            "[{}] Opened, TX {} RX {}",
            inner.config.name, inner.config.send_signal, inner.config.receive_signal
        );
        Ok(Self {
            inner,
            fc_queue: Mutex::new(fc_queue),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Name of the channel
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Configuration the channel was opened with
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// True until the channel is closed
    pub fn is_open(&self) -> bool {
        self.inner.is_running()
    }

    /// Sends a message, as a single frame if it fits, otherwise as a first frame followed by
    /// consecutive frames paced by the receiver's flow control.
    ///
    /// Blocks until the last frame is published, and returns the number of frames sent
    pub fn send(&self, payload: &[u8]) -> TransportResult<usize> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        if payload.is_empty() {
            return Err(TransportError::EmptyPayload);
        }
        let settings = self.inner.config.frame_settings();
        let queue = self.fc_queue.lock().unwrap_or_else(PoisonError::into_inner);

        if payload.len() <= settings.max_single_frame_payload() {
            let sf = encode_single_frame(payload, &settings)?;
            debug!("[{}] TX SF {sf:02X?}", self.name());
            self.inner.publish(&sf)?;
            return Ok(1);
        }

        let mut session = SendSession::new(
            payload,
            &settings,
            self.inner.config.timing.max_wait_frames,
        )?;
        let timing = self.inner.config.timing.send_timing();
        let mut link = |frame: &[u8]| self.inner.publish(frame);

        // Anything still queued belongs to an earlier transmission
        while queue.try_recv().is_ok() {}
        self.inner.tx_active.store(true, Ordering::Release);
        let res = if self.inner.config.synthesize_flow_control {
            let mut source = LocalFlowControl(self.flow_control_policy().to_frame());
            session.run(&mut link, &mut source, &timing)
        } else {
            let mut source = WorkerFlowControl {
                queue: &*queue,
                inner: &self.inner,
            };
            session.run(&mut link, &mut source, &timing)
        };
        self.inner.tx_active.store(false, Ordering::Release);

        if let Err(e) = &res {
            error!(
                "[{}] Send of {} bytes failed in state {}: {e}",
                self.name(),
                payload.len(),
                session.state()
            );
        }
        res
    }

    /// Feeds one raw frame into the channel, as if it arrived on the receive signal.
    ///
    /// The receive worker calls this for every frame of the subscription
    pub fn on_frame_received(&self, frame: &[u8]) {
        self.inner.on_frame_received(frame)
    }

    /// Takes the most recently completed message, if any
    pub fn poll_message(&self) -> Option<Vec<u8>> {
        self.inner.lock_rx().completed.take()
    }

    /// Blocks until a complete message is available, or `timeout` passes.
    ///
    /// Receive errors do not end the wait, see [TransportChannel::last_error]
    pub fn wait_message(&self, timeout: Duration) -> TransportResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.inner.lock_rx();
        loop {
            if let Some(msg) = rx.completed.take() {
                return Ok(msg);
            }
            if !self.is_open() {
                return Err(TransportError::ChannelClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::ChannelTimeout(TimeoutKind::Message));
            }
            rx = match self.inner.message_ready.wait_timeout(rx, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Discards stale state, sends `payload` and waits up to `timeout` for the reply
    pub fn request(&self, payload: &[u8], timeout: Duration) -> TransportResult<Vec<u8>> {
        self.clear();
        self.send(payload)?;
        self.wait_message(timeout)
    }

    /// Publishes a flow control frame. Used when `frame_control_auto` is off.
    ///
    /// A CONTINUE frame starts a block of `block_size` frames for the message being received
    pub fn send_flow_control(
        &self,
        flag: FlowStatus,
        block_size: u8,
        separation_time: u8,
    ) -> TransportResult<()> {
        let fc = FlowControlFrame::new(flag, block_size, separation_time)?;
        let mut rx = self.inner.lock_rx();
        self.inner.publish_flow_control(&fc)?;
        rx.pending_flow_control = None;
        rx.reassembler.on_flow_control_sent(&fc);
        if flag == FlowStatus::Overflow {
            rx.reassembler.clear();
        }
        Ok(())
    }

    /// Flow control due but not sent, because `frame_control_auto` is off
    pub fn pending_flow_control(&self) -> Option<FlowStatus> {
        self.inner.lock_rx().pending_flow_control
    }

    /// Current flow control policy
    pub fn flow_control_policy(&self) -> FlowControlPolicy {
        self.inner.policy()
    }

    /// Replaces the flow control policy.
    ///
    /// A block already granted to a sender is received in full, the new block size is sent
    /// with the next flow control frame
    pub fn set_flow_control_policy(&self, policy: FlowControlPolicy) -> TransportResult<()> {
        policy.validate()?;
        *self
            .inner
            .policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = policy;
        self.inner.lock_rx().reassembler.set_block_size(policy.block_size);
        debug!("[{}] Flow control policy set to {policy:?}", self.name());
        Ok(())
    }

    /// State of the receive side
    pub fn rx_state(&self) -> RxState {
        self.inner.lock_rx().reassembler.state()
    }

    /// Last error the receive side ran into
    pub fn last_error(&self) -> Option<TransportError> {
        self.inner.lock_rx().last_error.clone()
    }

    /// Discards any partial or completed message and the last error
    pub fn clear(&self) {
        let mut rx = self.inner.lock_rx();
        rx.reassembler.clear();
        rx.completed = None;
        rx.last_error = None;
        rx.pending_flow_control = None;
    }

    /// Stops the receive worker and ends the subscription.
    ///
    /// A send in progress fails with [TransportError::ChannelClosed]. Closing twice does nothing
    pub fn close(&self) -> TransportResult<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        // Wake anything blocked in wait_message
        drop(self.inner.lock_rx());
        self.inner.message_ready.notify_all();
        let res = self.inner.broker.unsubscribe(&self.inner.config.receive_signal);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker
            && handle.join().is_err()
        {
            error!("[{}] Receive worker panicked", self.name());
        }
        self.inner.lock_rx().reassembler.clear();
        debug!("[{}] Closed", self.name());
        res
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("[{}] Error closing channel: {e}", self.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{simulation::SimulatedBroker, SignalId};

    fn setup(cfg: impl FnOnce(&mut ChannelConfig)) -> (Arc<SimulatedBroker>, TransportChannel) {
        let _ = env_logger::try_init();
        let broker = Arc::new(SimulatedBroker::new());
        let mut config = ChannelConfig::new("tester", "TesterReq", "EcuResp", "Diag");
        cfg(&mut config);
        let channel = TransportChannel::open(broker.clone(), config).unwrap();
        (broker, channel)
    }

    fn req() -> SignalId {
        SignalId::new("TesterReq", "Diag")
    }

    #[test]
    fn single_frame_on_the_wire() {
        let (broker, channel) = setup(|_| {});
        assert_eq!(channel.send(&[0x22, 0xED, 0xA0]).unwrap(), 1);
        assert_eq!(
            broker.published(&req()),
            vec![vec![0x03, 0x22, 0xED, 0xA0, 0x00, 0x00, 0x00, 0x00]]
        );
    }

    #[test]
    fn single_frame_completes_message() {
        let (_broker, channel) = setup(|_| {});
        channel.on_frame_received(&[0x03, 0x62, 0xED, 0xA0, 0, 0, 0, 0]);
        assert_eq!(channel.poll_message(), Some(vec![0x62, 0xED, 0xA0]));
        assert_eq!(channel.poll_message(), None);
    }

    #[test]
    fn empty_payload_rejected() {
        let (_broker, channel) = setup(|_| {});
        assert_eq!(channel.send(&[]), Err(TransportError::EmptyPayload));
    }

    #[test]
    fn first_frame_answered_with_policy() {
        let (broker, channel) = setup(|c| {
            c.flow_control.block_size = 4;
            c.flow_control.separation_time_ms = 5;
        });
        channel.on_frame_received(&[0x10, 0x14, 0x62, 0xF1, 0x90, 0x01, 0x02, 0x03]);
        assert_eq!(channel.rx_state(), RxState::Collecting);
        assert_eq!(
            broker.published(&req()),
            vec![vec![0x30, 0x04, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00]]
        );
    }

    #[test]
    fn policy_change_mid_collection() {
        let (broker, channel) = setup(|c| c.flow_control.block_size = 4);
        let payload = (0..60).collect::<Vec<u8>>();
        let frames = crate::frame::encode(&payload, &channel.config().frame_settings()).unwrap();
        assert_eq!(frames.len(), 9);

        for f in &frames[..4] {
            channel.on_frame_received(f);
        }
        channel
            .set_flow_control_policy(FlowControlPolicy {
                block_size: 2,
                ..channel.flow_control_policy()
            })
            .unwrap();
        channel.on_frame_received(&frames[4]);
        // The block of 4 granted with the first frame is completed first
        let fcs = broker.published(&req());
        assert_eq!(fcs.len(), 2);
        assert_eq!(fcs[0][..2], [0x30, 0x04]);
        assert_eq!(fcs[1][..2], [0x30, 0x02]);

        for f in &frames[5..] {
            channel.on_frame_received(f);
        }
        assert_eq!(broker.published(&req()).len(), 3);
        assert_eq!(channel.poll_message(), Some(payload));
        assert_eq!(channel.last_error(), None);
    }

    #[test]
    fn policy_rejects_reserved_separation_time() {
        let (_broker, channel) = setup(|_| {});
        let bad = FlowControlPolicy {
            separation_time_ms: 0xFA,
            ..FlowControlPolicy::default()
        };
        assert!(matches!(
            channel.set_flow_control_policy(bad),
            Err(TransportError::InvalidFlowControl(_))
        ));
        assert_eq!(channel.flow_control_policy(), FlowControlPolicy::default());
    }

    #[test]
    fn oversized_first_frame_gets_overflow() {
        let (broker, channel) = setup(|c| c.max_message_length = 16);
        channel.on_frame_received(&[0x10, 0x14, 0x62, 0xF1, 0x90, 0x01, 0x02, 0x03]);
        assert_eq!(channel.rx_state(), RxState::Error);
        assert_eq!(broker.published(&req())[0][0], 0x32);
        assert!(matches!(
            channel.last_error(),
            Some(TransportError::PayloadTooLarge { len: 20, max: 16 })
        ));
    }

    #[test]
    fn manual_flow_control() {
        let (broker, channel) = setup(|c| c.flow_control.frame_control_auto = false);
        channel.on_frame_received(&[0x10, 0x14, 0x62, 0xF1, 0x90, 0x01, 0x02, 0x03]);
        assert!(broker.published(&req()).is_empty());
        assert_eq!(channel.pending_flow_control(), Some(FlowStatus::Continue));

        channel.send_flow_control(FlowStatus::Continue, 0, 10).unwrap();
        assert_eq!(channel.pending_flow_control(), None);
        assert_eq!(
            broker.published(&req()),
            vec![vec![0x30, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00]]
        );
        assert!(matches!(
            channel.send_flow_control(FlowStatus::Continue, 0, 0xFA),
            Err(TransportError::InvalidFlowControl(_))
        ));
    }

    #[test]
    fn unexpected_flow_control_is_recorded() {
        let (_broker, channel) = setup(|_| {});
        channel.on_frame_received(&[0x30, 0x00, 0x00, 0, 0, 0, 0, 0]);
        assert_eq!(
            channel.last_error(),
            Some(ProtocolViolation::UnexpectedFlowControl.into())
        );
        assert_eq!(channel.rx_state(), RxState::Empty);
        channel.clear();
        assert_eq!(channel.last_error(), None);
    }

    #[test]
    fn out_of_order_consecutive_frame() {
        let (_broker, channel) = setup(|_| {});
        channel.on_frame_received(&[0x10, 0x14, 0, 1, 2, 3, 4, 5]);
        channel.on_frame_received(&[0x22, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(channel.rx_state(), RxState::Error);
        assert_eq!(
            channel.last_error(),
            Some(
                ProtocolViolation::SequenceMismatch {
                    expected: 1,
                    received: 2
                }
                .into()
            )
        );
        assert_eq!(channel.poll_message(), None);
    }

    #[test]
    fn wait_message_times_out() {
        let (_broker, channel) = setup(|_| {});
        let start = Instant::now();
        assert_eq!(
            channel.wait_message(Duration::from_millis(50)),
            Err(TransportError::ChannelTimeout(TimeoutKind::Message))
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn consecutive_frame_timeout() {
        let (_broker, channel) = setup(|c| c.timing.n_cr = Duration::from_millis(30));
        channel.on_frame_received(&[0x10, 0x14, 0, 1, 2, 3, 4, 5]);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(channel.rx_state(), RxState::Error);
        assert_eq!(
            channel.last_error(),
            Some(TransportError::ChannelTimeout(TimeoutKind::ConsecutiveFrame))
        );
    }

    #[test]
    fn close_unsubscribes_and_rejects_sends() {
        let (broker, channel) = setup(|_| {});
        let rx_signal = SignalId::new("EcuResp", "Diag");
        assert_eq!(broker.subscriber_count(&rx_signal), 1);
        channel.close().unwrap();
        assert!(!channel.is_open());
        assert_eq!(broker.subscriber_count(&rx_signal), 0);
        assert_eq!(channel.send(&[0x3E, 0x00]), Err(TransportError::ChannelClosed));
        assert_eq!(
            channel.wait_message(Duration::from_millis(10)),
            Err(TransportError::ChannelClosed)
        );
        channel.close().unwrap();
    }

    #[test]
    fn publish_failure_fails_send() {
        let (broker, channel) = setup(|_| {});
        broker.set_publish_failure(true);
        assert!(matches!(
            channel.send(&[0x3E, 0x00]),
            Err(TransportError::Broker(_))
        ));
    }

    #[test]
    fn synthesized_flow_control_sends_without_peer() {
        let (broker, channel) = setup(|c| c.synthesize_flow_control = true);
        let payload = (0..20).collect::<Vec<u8>>();
        assert_eq!(channel.send(&payload).unwrap(), 3);
        let frames = broker.published(&req());
        assert_eq!(frames[0][..2], [0x10, 0x14]);
        assert_eq!(frames[1][0], 0x21);
        assert_eq!(frames[2], vec![0x22, 13, 14, 15, 16, 17, 18, 19]);
    }
}
