use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::ConnectionState;

/// How the aggregate connection state is derived from the live channels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSampling {
    /// Report the state of a single live channel (the first by topic).
    /// A healthy channel can hide a failing one.
    SampleOne,
    /// Report the least healthy live channel.
    #[default]
    Worst,
}

impl HealthSampling {
    pub fn sample<I>(&self, states: I) -> Option<ConnectionState>
    where
        I: IntoIterator<Item = ConnectionState>,
    {
        let mut states = states.into_iter();
        match self {
            Self::SampleOne => states.next(),
            Self::Worst => states.max_by_key(|s| s.severity()),
        }
    }
}

/// Background task polling connection health. Stops on [`HealthMonitor::stop`] or drop.
pub struct HealthMonitor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub(crate) fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop polling and wait for the task to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
