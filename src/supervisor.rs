//! Component shutdown ordering.
//!
//! Components register in init order; `shutdown` stops them in reverse.
//! Every stop runs even when an earlier one fails, and the first error is
//! the one surfaced.

use crate::error::Result;
use async_trait::async_trait;
use tracing::{error, info};

/// A stoppable subsystem managed by the [`Supervisor`].
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    async fn stop(&self) -> Result<()>;
}

/// Owns the ordered set of running components.
#[derive(Default)]
pub struct Supervisor {
    components: Vec<Box<dyn Component>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a started component. Registration order is init order.
    pub fn register(&mut self, component: Box<dyn Component>) {
        self.components.push(component);
    }

    /// Stops every component in reverse init order, surfacing the first
    /// error while still running all remaining stops.
    pub async fn shutdown(&mut self) -> Result<()> {
        let mut first_error = None;

        for component in self.components.drain(..).rev() {
            info!(component = component.name(), "stopping");

            if let Err(err) = component.stop().await {
                error!(component = component.name(), %err, "stop failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
