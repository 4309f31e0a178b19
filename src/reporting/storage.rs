use std::{
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Result;
use chrono::NaiveDate;
use fs4::tokio::AsyncFileExt;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
};
use tracing::{debug, warn};

use crate::utils::time::date_to_record_name;

use super::entities::ActivityReport;

/// Interface for abstracting storage of reports.
pub trait ReportStorage {
    type ReportFile: ReportFileHandle;

    /// Opens or creates the report file of a UTC day.
    fn open_day(&self, date: NaiveDate) -> impl Future<Output = Result<Self::ReportFile>>;

    /// Reads every report stored for a day. A day without a file has no reports.
    fn reports_for(
        &self,
        date: NaiveDate,
    ) -> impl Future<Output = Result<Vec<ActivityReport>>> + Send;
}

pub trait ReportFileHandle {
    fn append(&mut self, reports: Vec<ActivityReport>) -> impl Future<Output = Result<()>>;
    fn date(&self) -> NaiveDate;
    fn flush(&mut self) -> impl Future<Output = Result<()>>;
}

/// Stores reports as JSON lines, one file per day, named by [date_to_record_name].
pub struct ReportStorageImpl {
    report_dir: PathBuf,
}

impl ReportStorageImpl {
    pub fn new(report_dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&report_dir)?;

        Ok(Self { report_dir })
    }

    fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.report_dir.join(date_to_record_name(date))
    }

    async fn read_all(path: &Path) -> Result<Vec<ActivityReport>> {
        async fn extract(path: &Path) -> std::result::Result<Vec<ActivityReport>, std::io::Error> {
            debug!("Extracting {path:?}");
            let file = File::open(path).await?;
            file.lock_shared()?;
            let buffer = BufReader::new(file);
            let mut lines = buffer.lines();
            let mut reports = vec![];
            while let Ok(Some(v)) = lines.next_line().await {
                if v.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ActivityReport>(&v) {
                    Ok(v) => reports.push(v),
                    Err(e) => {
                        // A write cut short by a crash leaves a partial line behind.
                        warn!(
                            "During parsing in path {:?} found illegal json string {}:  {e}",
                            path, &v
                        )
                    }
                }
            }

            lines.into_inner().into_inner().unlock_async().await?;

            Ok(reports)
        }

        match extract(path).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }
}

impl ReportStorage for ReportStorageImpl {
    type ReportFile = DailyReportFile<File>;

    async fn open_day(&self, date: NaiveDate) -> Result<Self::ReportFile> {
        let file = File::options()
            .append(true)
            .create(true)
            .open(self.day_path(date))
            .await?;

        Ok(DailyReportFile::new(file, date))
    }

    async fn reports_for(&self, date: NaiveDate) -> Result<Vec<ActivityReport>> {
        Self::read_all(&self.day_path(date)).await
    }
}

pub struct DailyReportFile<F> {
    file: F,
    date: NaiveDate,
}

impl<F: AsyncWrite + AsyncFileExt + Unpin> DailyReportFile<F> {
    fn new(file: F, date: NaiveDate) -> Self {
        Self { file, date }
    }

    async fn append_inner(&mut self, reports: Vec<ActivityReport>) -> Result<()> {
        let mut buffer = Vec::<u8>::new();
        for report in reports {
            serde_json::to_writer(&mut buffer, &report)?;
            buffer.push(b'\n');
        }

        self.file.lock_exclusive()?;
        let result = async {
            self.file.write_all(&buffer).await?;
            self.file.flush().await
        }
        .await;
        self.file.unlock_async().await?;
        Ok(result?)
    }
}

impl<F: AsyncWrite + AsyncFileExt + Unpin> ReportFileHandle for DailyReportFile<F> {
    async fn append(&mut self, reports: Vec<ActivityReport>) -> Result<()> {
        self.append_inner(reports).await
    }

    fn date(&self) -> NaiveDate {
        self.date
    }

    async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use anyhow::Result;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
    use tempfile::tempdir;

    use crate::{
        reporting::{
            entities::ActivityReport,
            storage::{ReportFileHandle, ReportStorage, ReportStorageImpl},
        },
        utils::{logging::TEST_LOGGING, time::date_to_record_name},
    };

    const TEST_DATE: NaiveDate = NaiveDate::from_ymd_opt(2018, 7, 4).unwrap();
    const TEST_START_DATE: NaiveDateTime = NaiveDateTime::new(TEST_DATE, NaiveTime::MIN);

    fn report(offset_seconds: i64, tracked_seconds: u64) -> ActivityReport {
        ActivityReport {
            moment: Utc.from_utc_datetime(&TEST_START_DATE) + chrono::Duration::seconds(offset_seconds),
            session_elapsed_seconds: tracked_seconds,
            tracked_seconds,
            idle_seconds: 0,
            key_events: 3,
            mouse_events: 1,
            mouse_motion: 12,
            screenshot: None,
        }
    }

    #[tokio::test]
    async fn appends_survive_reopening() -> Result<()> {
        let dir = tempdir()?;
        let storage = ReportStorageImpl::new(dir.path().to_path_buf())?;

        let mut file = storage.open_day(TEST_DATE).await?;
        assert_eq!(file.date(), TEST_DATE);
        file.append(vec![report(600, 600)]).await?;
        file.flush().await?;
        drop(file);

        let mut file = storage.open_day(TEST_DATE).await?;
        file.append(vec![report(1200, 600), report(1260, 60)]).await?;

        let reports = storage.reports_for(TEST_DATE).await?;
        assert_eq!(reports, vec![report(600, 600), report(1200, 600), report(1260, 60)]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_day_has_no_reports() -> Result<()> {
        let dir = tempdir()?;
        let storage = ReportStorageImpl::new(dir.path().join("reports"))?;
        assert!(storage.reports_for(TEST_DATE).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn corrupted_lines_are_skipped() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let storage = ReportStorageImpl::new(dir.path().to_path_buf())?;
        let mut file = storage.open_day(TEST_DATE).await?;
        file.append(vec![report(60, 60)]).await?;
        drop(file);

        let mut raw = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(date_to_record_name(TEST_DATE)))?;
        write!(raw, "{{\"moment\": 12, \"session_ela")?;
        drop(raw);

        let reports = storage.reports_for(TEST_DATE).await?;
        assert_eq!(reports, vec![report(60, 60)]);
        Ok(())
    }
}
