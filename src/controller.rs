// Async handle to the motion engine
//
// The engine lives in one tokio task together with the frame decoder. This
// handle talks to it over a call channel; motion calls resolve when the
// command completes, with the pose at completion.

use std::ops::ControlFlow;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{HANDSHAKE_RESEND, RobotConfig};
use crate::messages::{MotionEvent, OdometryFrame, Point, Pose};
use crate::motion::pose::wrap_angle;
use crate::motion::{Motion, MotionEngine};
use crate::protocol::link::{self, Link, LinkError, LinkEvent, SerialLink};
use crate::protocol::FrameDecoder;

/// Pending calls buffered between the handle and the engine task
const CALL_DEPTH: usize = 32;

/// Events buffered per subscriber before it starts lagging
const EVENT_DEPTH: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error("Motion controller is already open")]
    AlreadyOpen,

    #[error("Motion controller is not open")]
    NotOpen,

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Motion task is gone (link disconnected or closed)")]
    Disconnected,

    #[error("Command was cancelled before it completed")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, MotionError>;

/// How `stop` brings the robot to rest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopMode {
    /// Ramp down from the measured wheel speeds
    #[default]
    Soft,
    /// Stop the motors at once
    Hard,
}

type Reply<T> = oneshot::Sender<link::Result<T>>;

enum Call {
    Start {
        motion: Motion,
        done: oneshot::Sender<Pose>,
        reply: Reply<()>,
    },
    HardStop(Reply<Pose>),
    EmergencyStop(Reply<()>),
    SpeedLeftRight {
        left: f64,
        right: f64,
        reply: Reply<()>,
    },
    SetDebugLevel {
        level: u8,
        reply: Reply<()>,
    },
    IsReady(Reply<()>),
    AppendPose(Pose),
    SetTrackPose(bool),
    SetHeading(f64),
    History(oneshot::Sender<Vec<Pose>>),
    Close(Reply<()>),
}

struct Connection {
    calls: mpsc::Sender<Call>,
    pose: watch::Receiver<Pose>,
}

/// Public entry point for driving the robot
pub struct MotionController {
    port: String,
    baud_rate: u32,
    config: RobotConfig,
    events: broadcast::Sender<MotionEvent>,
    connection: Mutex<Option<Connection>>,
}

impl MotionController {
    /// `config` is already validated; nothing is opened until `init`
    pub fn new(port: impl Into<String>, baud_rate: u32, config: RobotConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_DEPTH);
        Self {
            port: port.into(),
            baud_rate,
            config,
            events,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RobotConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MotionEvent> {
        self.events.subscribe()
    }

    fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_open(&self) -> bool {
        self.connection()
            .as_ref()
            .is_some_and(|c| !c.calls.is_closed())
    }

    /// Open the serial port and wait for the device handshake
    pub async fn init(&self) -> Result<()> {
        if self.is_open() {
            return Err(MotionError::AlreadyOpen);
        }
        let (link, inbound) = SerialLink::open(&self.port, self.baud_rate)?;
        self.init_with(link, inbound).await
    }

    /// Start the engine on an already open link and wait for the device
    /// handshake. The ready query is resent until the device answers.
    pub async fn init_with<L: Link>(&self, link: L, inbound: mpsc::Receiver<LinkEvent>) -> Result<()> {
        let ready = {
            let mut connection = self.connection();
            if connection.as_ref().is_some_and(|c| !c.calls.is_closed()) {
                return Err(MotionError::AlreadyOpen);
            }

            let (calls_tx, calls_rx) = mpsc::channel(CALL_DEPTH);
            let (pose_tx, pose_rx) = watch::channel(Pose::default());
            let (ready_tx, ready_rx) = oneshot::channel();

            let engine = MotionEngine::new(self.config.clone(), link, self.events.clone());
            tokio::spawn(drive(engine, inbound, calls_rx, pose_tx, ready_tx));

            *connection = Some(Connection {
                calls: calls_tx,
                pose: pose_rx,
            });
            ready_rx
        };

        ready.await.map_err(|_| MotionError::Disconnected)?;
        info!("Motion controller ready");
        Ok(())
    }

    fn calls(&self) -> Result<mpsc::Sender<Call>> {
        self.connection()
            .as_ref()
            .map(|c| c.calls.clone())
            .ok_or(MotionError::NotOpen)
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Call) -> Result<T> {
        let calls = self.calls()?;
        let (tx, rx) = oneshot::channel();
        calls
            .send(make(tx))
            .await
            .map_err(|_| MotionError::Disconnected)?;
        Ok(rx.await.map_err(|_| MotionError::Disconnected)??)
    }

    async fn notify(&self, call: Call) -> Result<()> {
        self.calls()?
            .send(call)
            .await
            .map_err(|_| MotionError::Disconnected)
    }

    /// Start a command and wait for it to finish
    async fn execute(&self, motion: Motion) -> Result<Pose> {
        let calls = self.calls()?;
        let (done_tx, done_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        calls
            .send(Call::Start {
                motion,
                done: done_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| MotionError::Disconnected)?;
        reply_rx.await.map_err(|_| MotionError::Disconnected)??;

        done_rx.await.map_err(|_| {
            if calls.is_closed() {
                MotionError::Disconnected
            } else {
                MotionError::Cancelled
            }
        })
    }

    /// Ask the device to report ready again
    pub async fn is_ready(&self) -> Result<()> {
        self.call(Call::IsReady).await
    }

    /// Record every pose change for `pose_history`
    pub async fn set_track_pose(&self, enabled: bool) -> Result<()> {
        self.notify(Call::SetTrackPose(enabled)).await
    }

    pub async fn set_debug_level(&self, level: u8) -> Result<()> {
        self.call(|reply| Call::SetDebugLevel { level, reply }).await
    }

    /// Latest authoritative pose
    pub fn pose(&self) -> Result<Pose> {
        self.connection()
            .as_ref()
            .map(|c| *c.pose.borrow())
            .ok_or(MotionError::NotOpen)
    }

    /// Overwrite the pose estimate (e.g. after relocalization)
    pub async fn append_pose(&self, pose: Pose) -> Result<()> {
        self.notify(Call::AppendPose(pose)).await
    }

    /// Feed an external heading sample (rad) for heading fusion
    pub async fn set_external_heading(&self, heading: f64) -> Result<()> {
        self.notify(Call::SetHeading(heading)).await
    }

    pub async fn pose_history(&self) -> Result<Vec<Pose>> {
        let calls = self.calls()?;
        let (tx, rx) = oneshot::channel();
        calls
            .send(Call::History(tx))
            .await
            .map_err(|_| MotionError::Disconnected)?;
        rx.await.map_err(|_| MotionError::Disconnected)
    }

    /// Drive each wheel directly (mm/s, sign = direction)
    pub async fn speed_left_right(&self, left: f64, right: f64) -> Result<()> {
        self.call(|reply| Call::SpeedLeftRight { left, right, reply })
            .await
    }

    /// Straight run without heading correction; tick totals are logged
    pub async fn distance_calibration_test(&self, distance: f64) -> Result<Pose> {
        self.execute(Motion::CalibrationTest { distance }).await
    }

    /// Hold `speed` (mm/s) and `heading` (rad) until `until` returns true.
    /// The wheels keep their last setpoint afterwards.
    pub async fn speed_heading<F>(&self, speed: f64, heading: f64, until: F) -> Result<Pose>
    where
        F: FnMut(&OdometryFrame, &Pose) -> bool + Send + 'static,
    {
        self.execute(Motion::SpeedHeading {
            speed,
            heading,
            until: Box::new(until),
        })
        .await
    }

    /// Drive `distance` mm (negative = reverse) holding `heading` rad
    pub async fn distance_heading(&self, distance: f64, heading: f64) -> Result<Pose> {
        self.execute(Motion::DistanceHeading { distance, heading })
            .await
    }

    /// Turn in place by `angle` rad relative to the current heading
    pub async fn rotate(&self, angle: f64) -> Result<Pose> {
        self.execute(Motion::Rotate { angle }).await
    }

    pub async fn stop(&self, mode: StopMode) -> Result<Pose> {
        match mode {
            StopMode::Soft => self.execute(Motion::SoftStop).await,
            StopMode::Hard => self.call(Call::HardStop).await,
        }
    }

    /// Face `target`, then drive to it
    pub async fn move_to_xy(&self, target: Point) -> Result<Pose> {
        let start = self.pose()?;
        let bearing = start.bearing_to(target);
        debug!("Move to ({:.1}, {:.1}), bearing {:.3}", target.x, target.y, bearing);

        let facing = self.rotate(wrap_angle(bearing - start.phi)).await?;
        self.distance_heading(facing.distance_to(target), bearing)
            .await
    }

    /// `move_to_xy`, then turn to `heading`
    pub async fn move_to_xy_phi(&self, target: Point, heading: f64) -> Result<Pose> {
        let arrived = self.move_to_xy(target).await?;
        self.rotate(wrap_angle(heading - arrived.phi)).await
    }

    /// Cancel the running command without completing it and stop at once
    pub async fn emergency_stop(&self) -> Result<()> {
        self.call(Call::EmergencyStop).await
    }

    /// Stop the board and close the link
    pub async fn close(&self) -> Result<()> {
        let connection = self.connection().take().ok_or(MotionError::NotOpen)?;
        let (tx, rx) = oneshot::channel();
        connection
            .calls
            .send(Call::Close(tx))
            .await
            .map_err(|_| MotionError::Disconnected)?;
        rx.await.map_err(|_| MotionError::Disconnected)??;
        info!("Motion controller closed");
        Ok(())
    }
}

/// Engine task: handshake, inbound frames and calls, in arrival order
async fn drive<L: Link>(
    mut engine: MotionEngine<L>,
    mut inbound: mpsc::Receiver<LinkEvent>,
    mut calls: mpsc::Receiver<Call>,
    pose: watch::Sender<Pose>,
    ready: oneshot::Sender<()>,
) {
    let mut decoder = FrameDecoder::new();
    let mut ready = Some(ready);

    if let Err(e) = engine.request_ready() {
        report(&engine, &e);
    }
    let mut handshake = interval(HANDSHAKE_RESEND);
    handshake.reset();

    loop {
        tokio::select! {
            _ = handshake.tick(), if ready.is_some() => {
                debug!("No ready yet, asking again");
                if let Err(e) = engine.request_ready() {
                    report(&engine, &e);
                }
            }
            event = inbound.recv() => match event {
                Some(LinkEvent::Data(bytes)) => {
                    for frame in decoder.decode(&bytes) {
                        if let Err(e) = engine.handle(frame) {
                            report(&engine, &e);
                        }
                    }
                    if engine.is_ready()
                        && let Some(tx) = ready.take()
                    {
                        let _ = tx.send(());
                    }
                    pose.send_replace(engine.pose());
                }
                Some(LinkEvent::Error(e)) => report(&engine, &e),
                Some(LinkEvent::Disconnected) | None => {
                    warn!("Serial link disconnected");
                    engine.emit(MotionEvent::Disconnect);
                    break;
                }
            },
            call = calls.recv() => match call {
                Some(call) => {
                    if on_call(&mut engine, call, &pose).is_break() {
                        break;
                    }
                }
                None => {
                    debug!("All controller handles dropped, closing link");
                    if let Err(e) = engine.close() {
                        warn!("Close failed: {}", e);
                    }
                    break;
                }
            },
        }
    }

    // Mark the connection dead before pending completions are dropped
    calls.close();
    drop(engine);
    debug!("Motion task stopped");
}

fn report<L: Link>(engine: &MotionEngine<L>, error: &LinkError) {
    warn!("Link error: {}", error);
    engine.emit(MotionEvent::Error(error.to_string()));
}

/// Apply one call; `Break` once the link has been closed
fn on_call<L: Link>(
    engine: &mut MotionEngine<L>,
    call: Call,
    pose: &watch::Sender<Pose>,
) -> ControlFlow<()> {
    match call {
        Call::Start {
            motion,
            done,
            reply,
        } => {
            let _ = reply.send(engine.start(motion, done));
        }
        Call::HardStop(reply) => {
            let _ = reply.send(engine.hard_stop().map(|()| engine.pose()));
        }
        Call::EmergencyStop(reply) => {
            let _ = reply.send(engine.emergency_stop());
        }
        Call::SpeedLeftRight { left, right, reply } => {
            let _ = reply.send(engine.speed_left_right(left, right));
        }
        Call::SetDebugLevel { level, reply } => {
            let _ = reply.send(engine.set_debug_level(level));
        }
        Call::IsReady(reply) => {
            let _ = reply.send(engine.request_ready());
        }
        Call::AppendPose(new_pose) => {
            engine.append_pose(new_pose);
            pose.send_replace(engine.pose());
        }
        Call::SetTrackPose(enabled) => engine.set_track_pose(enabled),
        Call::SetHeading(heading) => engine.set_heading(heading),
        Call::History(reply) => {
            let _ = reply.send(engine.history());
        }
        Call::Close(reply) => {
            let _ = reply.send(engine.close());
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::motion::engine::tests::MockLink;
    use crate::protocol::codec::CMD_READY;
    use crate::protocol::encode_device_frame;

    fn ready_frame() -> LinkEvent {
        LinkEvent::Data(encode_device_frame(CMD_READY, &[]))
    }

    #[tokio::test]
    async fn test_not_open() {
        let controller = MotionController::new("/dev/null", 115_200, test_config());
        assert!(matches!(controller.pose(), Err(MotionError::NotOpen)));
        assert!(matches!(
            controller.rotate(1.0).await,
            Err(MotionError::NotOpen)
        ));
        assert!(matches!(controller.close().await, Err(MotionError::NotOpen)));
    }

    #[tokio::test]
    async fn test_init_and_already_open() {
        let controller = MotionController::new("/dev/null", 115_200, test_config());
        let link = MockLink::default();
        let (tx, rx) = mpsc::channel(8);
        tx.send(ready_frame()).await.unwrap();

        controller.init_with(link.clone(), rx).await.unwrap();
        assert_eq!(link.requests()[0], vec![0xA3, 0x01]);

        // A second init fails without touching the link
        let (_tx2, rx2) = mpsc::channel(8);
        let before = link.requests().len();
        assert!(matches!(
            controller.init_with(MockLink::default(), rx2).await,
            Err(MotionError::AlreadyOpen)
        ));
        assert!(matches!(controller.init().await, Err(MotionError::AlreadyOpen)));
        assert_eq!(link.requests().len(), before);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_init() {
        let controller = MotionController::new("/dev/null", 115_200, test_config());
        let mut events = controller.subscribe();
        let (tx, rx) = mpsc::channel(8);
        tx.send(LinkEvent::Disconnected).await.unwrap();

        assert!(matches!(
            controller.init_with(MockLink::default(), rx).await,
            Err(MotionError::Disconnected)
        ));
        assert_eq!(events.recv().await.unwrap(), MotionEvent::Disconnect);
    }

    #[tokio::test]
    async fn test_append_pose_updates_watch() {
        let controller = MotionController::new("/dev/null", 115_200, test_config());
        let (tx, rx) = mpsc::channel(8);
        tx.send(ready_frame()).await.unwrap();
        controller.init_with(MockLink::default(), rx).await.unwrap();

        controller.set_track_pose(true).await.unwrap();
        let pose = Pose::new(1.0, 2.0, 0.3);
        controller.append_pose(pose).await.unwrap();
        // History round-trips through the task, so the append is applied by now
        assert_eq!(controller.pose_history().await.unwrap(), vec![pose]);
        assert_eq!(controller.pose().unwrap(), pose);

        controller.close().await.unwrap();
        assert!(matches!(controller.pose(), Err(MotionError::NotOpen)));
    }

    #[tokio::test]
    async fn test_close_ends_engine_task() {
        let controller = MotionController::new("/dev/null", 115_200, test_config());
        let link = MockLink::default();
        let (tx, rx) = mpsc::channel(8);
        tx.send(ready_frame()).await.unwrap();
        controller.init_with(link.clone(), rx).await.unwrap();

        controller.close().await.unwrap();
        assert!(*link.closed.lock().unwrap());
        assert_eq!(link.requests().last(), Some(&vec![0xA3, 0x03]));
        // The task has stopped reading its inbound channel
        tx.closed().await;

        let (tx2, rx2) = mpsc::channel(8);
        tx2.send(ready_frame()).await.unwrap();
        controller.init_with(MockLink::default(), rx2).await.unwrap();
        controller.close().await.unwrap();
    }
}
