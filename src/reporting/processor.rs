use anyhow::Result;

use super::entities::ActivityReport;

/// Destination of activity reports. Local storage is the only implementation for now, a remote
/// endpoint would slot in here as well.
pub trait ReportProcessor {
    fn process_next(&mut self, report: ActivityReport) -> impl std::future::Future<Output = Result<()>>;

    fn finalize(&mut self) -> impl std::future::Future<Output = Result<()>>;
}
