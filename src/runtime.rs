// Zenoh bridge around the motion controller
//
// 50 Hz loop: drain motion requests from the command topic, hand each to the
// controller on its own task, then publish whatever telemetry the engine
// emitted since the last tick. Motion requests never block the loop; a new
// motion request replaces the one still running.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::interval;
use tracing::{debug, info, warn};
use zenoh::pubsub::Publisher;

use crate::config::{
    BRIDGE_LOOP_HZ, RobotConfig, TOPIC_CMD_MOTION, TOPIC_DEBUG, TOPIC_LINK, TOPIC_ODOMETRY, TOPIC_POSE,
    TOPIC_SPEED,
};
use crate::controller::{MotionController, MotionError, StopMode};
use crate::messages::{MotionEvent, MotionRequest, OdometryFrame, Pose};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub port: String,
    pub config_path: PathBuf,
    pub baud_rate: u32,
}

/// One publisher per telemetry topic
struct Telemetry {
    pose: Publisher<'static>,
    odometry: Publisher<'static>,
    debug: Publisher<'static>,
    speed: Publisher<'static>,
    link: Publisher<'static>,
}

impl Telemetry {
    async fn declare(session: &zenoh::Session) -> Result<Self, BoxError> {
        Ok(Self {
            pose: session.declare_publisher(TOPIC_POSE).await?,
            odometry: session.declare_publisher(TOPIC_ODOMETRY).await?,
            debug: session.declare_publisher(TOPIC_DEBUG).await?,
            speed: session.declare_publisher(TOPIC_SPEED).await?,
            link: session.declare_publisher(TOPIC_LINK).await?,
        })
    }

    fn publisher(&self, event: &MotionEvent) -> &Publisher<'static> {
        match event {
            MotionEvent::Pose(_) | MotionEvent::PoseOdom(_) | MotionEvent::PoseImu(_) => &self.pose,
            MotionEvent::Odometry(_) => &self.odometry,
            MotionEvent::Debug(_) => &self.debug,
            MotionEvent::Speed(_) => &self.speed,
            MotionEvent::Error(_) | MotionEvent::Disconnect | MotionEvent::Close => &self.link,
        }
    }

    async fn publish(&self, event: &MotionEvent) -> Result<(), BoxError> {
        let json = serde_json::to_string(event)?;
        self.publisher(event).put(json).await?;
        Ok(())
    }
}

fn log_outcome(name: &str, result: Result<Pose, MotionError>) {
    match result {
        Ok(pose) => info!("{} finished at ({:.1}, {:.1}, {:.3})", name, pose.x, pose.y, pose.phi),
        Err(MotionError::Cancelled) => info!("{} cancelled", name),
        Err(e) => warn!("{} failed: {}", name, e),
    }
}

fn log_error(name: &str, result: Result<(), MotionError>) {
    if let Err(e) = result {
        warn!("{} failed: {}", name, e);
    }
}

/// Run one request against the controller. Motion requests resolve on
/// their own task.
fn dispatch(controller: &Arc<MotionController>, request: MotionRequest) {
    let controller = Arc::clone(controller);
    tokio::spawn(async move {
        match request {
            MotionRequest::IsReady => log_error("is_ready", controller.is_ready().await),
            MotionRequest::SetTrackPose { enabled } => {
                log_error("set_track_pose", controller.set_track_pose(enabled).await)
            }
            MotionRequest::SetDebugLevel { level } => {
                log_error("set_debug_level", controller.set_debug_level(level).await)
            }
            MotionRequest::AppendPose { pose } => log_error("append_pose", controller.append_pose(pose).await),
            MotionRequest::Heading { phi } => {
                log_error("heading", controller.set_external_heading(phi).await)
            }
            MotionRequest::SpeedLeftRight { left, right } => log_error(
                "speed_left_right",
                controller.speed_left_right(left, right).await,
            ),
            MotionRequest::DistanceCalibrationTest { distance } => log_outcome(
                "distance_calibration_test",
                controller.distance_calibration_test(distance).await,
            ),
            MotionRequest::SpeedHeading {
                speed,
                heading,
                duration_ms,
            } => {
                // Frames arrive once per control loop
                let frames = (duration_ms as f64 / controller.config().loop_time).ceil() as u64;
                let mut seen = 0u64;
                let until = move |_: &OdometryFrame, _: &Pose| {
                    seen += 1;
                    seen >= frames
                };
                log_outcome(
                    "speed_heading",
                    controller.speed_heading(speed, heading, until).await,
                )
            }
            MotionRequest::DistanceHeading { distance, heading } => log_outcome(
                "distance_heading",
                controller.distance_heading(distance, heading).await,
            ),
            MotionRequest::Rotate { angle } => log_outcome("rotate", controller.rotate(angle).await),
            MotionRequest::Stop { hard } => {
                let mode = if hard { StopMode::Hard } else { StopMode::Soft };
                log_outcome("stop", controller.stop(mode).await)
            }
            MotionRequest::MoveToXy { target } => {
                log_outcome("move_to_xy", controller.move_to_xy(target).await)
            }
            MotionRequest::MoveToXyPhi { target, heading } => log_outcome(
                "move_to_xy_phi",
                controller.move_to_xy_phi(target, heading).await,
            ),
            MotionRequest::EmergencyStop => {
                log_error("emergency_stop", controller.emergency_stop().await)
            }
            // Handled by the bridge loop
            MotionRequest::Shutdown => {}
        }
    });
}

pub async fn run(options: RuntimeOptions) -> Result<(), BoxError> {
    // Fails before the port is touched when keys are missing
    let config = RobotConfig::load(&options.config_path)?;
    info!("Loaded robot config from {}", options.config_path.display());

    let controller = Arc::new(MotionController::new(
        options.port.clone(),
        options.baud_rate,
        config,
    ));
    let mut events = controller.subscribe();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_MOTION).await?;
    let telemetry = Telemetry::declare(&session).await?;

    info!("Waiting for motor controller on {}...", options.port);
    controller.init().await?;

    let mut tick = interval(Duration::from_millis(1000 / BRIDGE_LOOP_HZ));
    info!("Bridge started: {}Hz loop", BRIDGE_LOOP_HZ);
    info!("Subscribed to: {}", TOPIC_CMD_MOTION);
    info!(
        "Publishing to: {}, {}, {}, {}, {}",
        TOPIC_POSE, TOPIC_ODOMETRY, TOPIC_DEBUG, TOPIC_SPEED, TOPIC_LINK
    );

    loop {
        tick.tick().await;

        // 1. Drain all pending requests (non-blocking)
        let mut shutdown = false;
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<MotionRequest>(&payload) {
                Ok(MotionRequest::Shutdown) => shutdown = true,
                Ok(request) => {
                    debug!("Received request: {:?}", request);
                    dispatch(&controller, request);
                }
                Err(e) => {
                    warn!("Failed to parse request: {}", e);
                }
            }
        }

        // 2. Publish telemetry emitted since the last tick
        let mut disconnected = false;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    disconnected |= event == MotionEvent::Disconnect;
                    telemetry.publish(&event).await?;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Telemetry lagging, skipped {} events", skipped);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }

        if disconnected {
            return Err("Serial link disconnected".into());
        }
        if shutdown {
            info!("Shutdown requested");
            controller.close().await?;
            // Let listeners see the close event
            while let Ok(event) = events.try_recv() {
                telemetry.publish(&event).await?;
            }
            return Ok(());
        }
    }
}
