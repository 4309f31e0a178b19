//! Persisting what the tracker reports. [ReportingModule] receives [entities::ActivityReport]s
//! from the tracker module and hands them to a [processor::ReportProcessor].
//!  - Reports are stored in a directory with one JSON-lines file per UTC day.
//!  - Each line is a delta since the previous report of the session.

use anyhow::Result;
use processor::ReportProcessor;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info};

use entities::ActivityReport;

pub mod entities;
pub mod local_save;
pub mod processor;
pub mod storage;

pub struct ReportingModule<Processor> {
    receiver: Receiver<ActivityReport>,
    processor: Processor,
}

impl<P: ReportProcessor> ReportingModule<P> {
    pub fn new(receiver: Receiver<ActivityReport>, processor: P) -> Self {
        Self {
            receiver,
            processor,
        }
    }

    /// Runs until every sender of reports is dropped.
    pub async fn run(mut self) -> Result<()> {
        while let Some(report) = self.receiver.recv().await {
            debug!("Processing report {:?}", report);
            match self.processor.process_next(report.clone()).await {
                Ok(_) => {
                    info!("Stored report for {}", report.moment)
                }
                Err(e) => {
                    error!("Error storing report {:?}: {e:?}", report)
                }
            }
        }

        let result = self.processor.finalize().await;
        self.receiver.close();
        result
    }
}
