use anyhow::Result;
use chrono::NaiveDate;

use super::{
    entities::ActivityReport,
    processor::ReportProcessor,
    storage::{ReportFileHandle, ReportStorage},
};

/// Bridges [ReportingModule](super::ReportingModule) and [ReportStorage]. Keeps the file of the
/// last report's day open and moves to another one when a report belongs to a different UTC day.
pub struct LocalReportSaver<R: ReportStorage> {
    storage: R,
    current_handle: Option<R::ReportFile>,
}

impl<R: ReportStorage> LocalReportSaver<R> {
    pub fn new(storage: R) -> Self {
        Self {
            storage,
            current_handle: None,
        }
    }

    async fn move_file_handle(&mut self, day: NaiveDate) -> Result<R::ReportFile> {
        let current_file = self.current_handle.take();

        match current_file {
            Some(mut file) if file.date() != day => {
                file.flush().await?;
            }
            Some(v) => return Ok(v),
            None => {}
        };
        self.storage.open_day(day).await
    }
}

impl<R: ReportStorage> ReportProcessor for LocalReportSaver<R> {
    async fn process_next(&mut self, report: ActivityReport) -> Result<()> {
        let mut active_file = self.move_file_handle(report.moment.date_naive()).await?;
        let result = active_file.append(vec![report]).await;
        self.current_handle = Some(active_file);
        result
    }

    async fn finalize(&mut self) -> Result<()> {
        if let Some(v) = self.current_handle.as_mut() {
            v.flush().await?;
        }
        Ok(())
    }
}
