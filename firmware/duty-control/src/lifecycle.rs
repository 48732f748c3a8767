use crate::backend::PwmBackend;
use crate::channel::{DutyPercent, PwmChannel, PERIOD_NS};
use crate::endpoint::ControlEndpoint;
use crate::error::StartError;
use crate::registry::{ClassId, NodeId, RegionId, Registry};
use log::{error, info, warn};
use std::sync::Arc;

/// Names and timing used to bring the controller up.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub region_name: String,
    pub class_name: String,
    pub node_name: String,
    pub channel: u8,
    pub period_ns: u64,
    pub default_duty: DutyPercent,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            region_name: "pwm_driver".into(),
            class_name: "pwm".into(),
            node_name: "pwm0".into(),
            channel: 0,
            period_ns: PERIOD_NS,
            default_duty: DutyPercent::DEFAULT,
        }
    }
}

/// Completed startup steps, in order. Unwinding pops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Region(RegionId),
    Class(ClassId),
    Acquired,
    Enabled,
    Node(NodeId),
}

/// A running PWM channel with its control node registered.
///
/// Startup:
/// 1. reserve a region
/// 2. create the class
/// 3. acquire the channel
/// 4. apply the default duty and enable the output
/// 5. register the control node
///
/// A failing step unwinds everything before it in reverse. Shutdown (or
/// drop) unwinds all five; teardown errors are logged and skipped.
pub struct Controller<B: PwmBackend + 'static, R: Registry> {
    config: ControllerConfig,
    registry: R,
    channel: Option<Arc<PwmChannel<B>>>,
    stages: Vec<Stage>,
}

impl<B: PwmBackend + 'static, R: Registry> Controller<B, R> {
    pub fn start(backend: B, registry: R, config: ControllerConfig) -> Result<Self, StartError> {
        let mut controller = Self {
            config,
            registry,
            channel: None,
            stages: Vec::with_capacity(5),
        };

        match controller.bring_up(backend) {
            Ok(()) => {
                info!(
                    "PWM controller up: /dev/{} -> channel {} ({}% of {}ns)",
                    controller.config.node_name,
                    controller.config.channel,
                    controller.config.default_duty.get(),
                    controller.config.period_ns
                );
                Ok(controller)
            }
            Err(err) => {
                error!("PWM controller startup failed: {}", err);
                controller.unwind();
                Err(err)
            }
        }
    }

    fn bring_up(&mut self, backend: B) -> Result<(), StartError> {
        let region = self
            .registry
            .alloc_region(&self.config.region_name)
            .map_err(StartError::Region)?;
        self.stages.push(Stage::Region(region));

        let class = self
            .registry
            .create_class(&self.config.class_name)
            .map_err(StartError::Class)?;
        self.stages.push(Stage::Class(class));

        let channel = Arc::new(PwmChannel::acquire(
            backend,
            self.config.channel,
            self.config.period_ns,
        )?);
        self.channel = Some(Arc::clone(&channel));
        self.stages.push(Stage::Acquired);

        channel.set_duty(self.config.default_duty)?;
        channel.enable()?;
        self.stages.push(Stage::Enabled);

        let endpoint = Arc::new(ControlEndpoint::new(&self.config.node_name, &channel));
        let node = self
            .registry
            .create_node(class, region, &self.config.node_name, endpoint)
            .map_err(StartError::Node)?;
        self.stages.push(Stage::Node(node));

        Ok(())
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn channel(&self) -> Option<&PwmChannel<B>> {
        self.channel.as_deref()
    }

    /// The registered control node, while running.
    pub fn node(&self) -> Option<NodeId> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::Node(node) => Some(*node),
            _ => None,
        })
    }

    pub fn is_running(&self) -> bool {
        matches!(self.stages.last(), Some(Stage::Node(_)))
    }

    pub fn shutdown(mut self) {
        info!("PWM controller shutting down");
        self.unwind();
    }

    fn unwind(&mut self) {
        while let Some(stage) = self.stages.pop() {
            match stage {
                Stage::Node(node) => {
                    if let Err(e) = self.registry.destroy_node(node) {
                        warn!("destroy node {:?}: {}", node, e);
                    }
                }
                Stage::Enabled => {
                    if let Some(channel) = &self.channel {
                        channel.retire();
                    }
                }
                Stage::Acquired => {
                    if let Some(channel) = self.channel.take() {
                        channel.retire();
                        let writers = Arc::strong_count(&channel) - 1;
                        if writers > 0 {
                            // The last in-flight writer frees the hardware.
                            info!(
                                "PWM channel {} release deferred to {} writer(s)",
                                channel.id(),
                                writers
                            );
                        }
                    }
                }
                Stage::Class(class) => {
                    if let Err(e) = self.registry.destroy_class(class) {
                        warn!("destroy class {:?}: {}", class, e);
                    }
                }
                Stage::Region(region) => {
                    if let Err(e) = self.registry.release_region(region) {
                        warn!("release region {:?}: {}", region, e);
                    }
                }
            }
        }
    }
}

impl<B: PwmBackend + 'static, R: Registry> Drop for Controller<B, R> {
    fn drop(&mut self) {
        self.unwind();
    }
}
