//! Background maintenance: history repair and garbage sweeping.
//!
//! Each pass:
//! 1. Repairs keys whose latest flags or null runs look inconsistent
//! 2. Deletes the backend content of failed or tombstoned records
//! 3. Purges the rows once their backend counterpart is gone
//!
//! Failures are logged and retried on the next pass.

use crate::{
    models::bucket::Bucket,
    services::{
        backend::{BackendKey, BackendStore},
        error::MetadataResult,
        metadata_service::MetadataService,
    },
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keys repaired per pass.
const REPAIR_BATCH: i64 = 500;

/// Counters of one maintenance pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub keys_repaired: usize,
    pub objects_purged: usize,
    pub parts_purged: usize,
    pub corrupt_skipped: usize,
    pub failures: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone)]
pub struct MaintenanceWorker {
    service: MetadataService,
    backend: Arc<dyn BackendStore>,
    interval: Duration,
}

impl MaintenanceWorker {
    pub fn new(service: MetadataService, backend: Arc<dyn BackendStore>, interval: Duration) -> Self {
        Self {
            service,
            backend,
            interval,
        }
    }

    /// Run one pass over every bucket.
    pub async fn run_once(&self) -> MetadataResult<SweepReport> {
        let mut report = SweepReport::default();

        for (bucket, key) in self.service.keys_needing_repair(REPAIR_BATCH).await? {
            match self.service.do_full_repair(&Bucket::named(&bucket), &key).await {
                Ok(repair) => {
                    report.corrupt_skipped += repair.corrupt;
                    if !repair.is_noop() {
                        report.keys_repaired += 1;
                    }
                }
                Err(err) => {
                    warn!(%bucket, %key, error = %err, "repair failed");
                    report.failures += 1;
                }
            }
        }

        for record in self.service.get_failed_or_deleted().await? {
            let (Some(uuid), Some(backend_key)) = (record.uuid, BackendKey::for_object(&record)) else {
                report.corrupt_skipped += 1;
                continue;
            };
            if let Err(err) = self.backend.delete(&backend_key).await {
                warn!(%uuid, key = %record.key, error = %err, "backend removal failed");
                report.failures += 1;
                continue;
            }
            match self.service.purge_object(uuid).await {
                Ok(true) => report.objects_purged += 1,
                Ok(false) => debug!(%uuid, "record changed before purge"),
                Err(err) => {
                    warn!(%uuid, error = %err, "purge failed");
                    report.failures += 1;
                }
            }
        }

        for part in self.service.get_deleted_parts().await? {
            if let Err(err) = self.backend.delete(&BackendKey::for_part(&part)).await {
                warn!(uuid = %part.uuid, upload_id = %part.upload_id, error = %err, "backend part removal failed");
                report.failures += 1;
                continue;
            }
            match self.service.purge_part(part.uuid).await {
                Ok(true) => report.parts_purged += 1,
                Ok(false) => debug!(uuid = %part.uuid, "part changed before purge"),
                Err(err) => {
                    warn!(uuid = %part.uuid, error = %err, "part purge failed");
                    report.failures += 1;
                }
            }
        }

        Ok(report)
    }

    /// Start the periodic loop; cancel the returned token to stop it.
    pub fn spawn(self) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move { self.run(token).await });
        cancel
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "maintenance worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("maintenance worker shutting down");
                    break;
                }
                _ = ticker.tick() => match self.run_once().await {
                    Ok(report) if report.is_empty() => debug!("maintenance pass found nothing to do"),
                    Ok(report) => info!(?report, "maintenance pass completed"),
                    Err(err) => warn!(error = %err, "maintenance pass failed"),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{bucket::VersioningStatus, object::ObjectRecord, part::PartRecord},
        services::{
            backend::{BodyStream, ContentReceipt, FsBackend},
            error::BackendError,
            metadata_service::insert_object,
            protocol::BackendOp,
            test_support::*,
        },
    };
    use bytes::Bytes;
    use chrono::Utc;
    use futures::{StreamExt, stream};
    use uuid::Uuid;

    fn body(data: &'static [u8]) -> BodyStream {
        stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
    }

    fn put_op(backend: &Arc<FsBackend>, key: BackendKey, data: &'static [u8]) -> BackendOp<ContentReceipt> {
        let writer = backend.clone();
        let cleaner = backend.clone();
        let rollback_key = key.clone();
        BackendOp::new(
            async move { writer.put(&key, body(data)).await },
            move || async move { cleaner.delete(&rollback_key).await },
        )
    }

    #[tokio::test]
    async fn sweep_removes_superseded_content_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FsBackend::new(dir.path()));
        let service = service().await;
        let bucket = bucket(VersioningStatus::Disabled);

        let mut written = Vec::new();
        for data in [&b"one"[..], &b"two"[..]] {
            let object = ObjectRecord::initialize(BUCKET, "notes.txt");
            let record = service
                .create(&bucket, object, |pending| {
                    let key = BackendKey::for_object(pending).unwrap();
                    put_op(&backend, key, data)
                })
                .await
                .unwrap();
            written.push(record);
        }
        assert_eq!(service.count_raw_entities(&bucket).await.unwrap(), 2);
        let superseded = BackendKey::for_object(&written[0]).unwrap();
        let current = BackendKey::for_object(&written[1]).unwrap();

        let worker = MaintenanceWorker::new(service.clone(), backend.clone(), Duration::from_secs(60));
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.objects_purged, 1);
        assert_eq!(report.failures, 0);
        assert_eq!(service.count_raw_entities(&bucket).await.unwrap(), 1);
        assert!(matches!(backend.get(&superseded).await, Err(BackendError::NotFound(_))));
        assert!(backend.get(&current).await.is_ok());

        let latest = service.get(&bucket, "notes.txt", None).await.unwrap();
        assert_eq!(latest.uuid, written[1].uuid);

        // a second pass has nothing left to do
        assert!(worker.run_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_deletes_backend_payload_of_tombstoned_record() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FsBackend::new(dir.path()));
        let service = service().await;
        let bucket = bucket(VersioningStatus::Disabled);

        let mut record = ObjectRecord::initialize(BUCKET, "gone.txt");
        record.uuid = Some(Uuid::new_v4());
        record.version_id = Some("null".into());
        record.last_modified = Some(Utc::now());
        record.deleted_timestamp = Some(Utc::now());
        insert_object(&*service.db, &record).await.unwrap();
        let key = BackendKey::for_object(&record).unwrap();
        backend.put(&key, body(b"stale")).await.unwrap();

        let worker = MaintenanceWorker::new(service.clone(), backend.clone(), Duration::from_secs(60));
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.objects_purged, 1);
        assert!(matches!(backend.get(&key).await, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn sweep_purges_aborted_upload_parts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FsBackend::new(dir.path()));
        let service = service().await;
        let bucket = bucket(VersioningStatus::Disabled);

        let upload = ObjectRecord::initialize(BUCKET, "big.bin").with_upload_id("u-9");
        service.create_pending(&bucket, upload).await.unwrap();
        for number in 1..=2 {
            let part = PartRecord::new(BUCKET, "big.bin", "u-9", number);
            let key = BackendKey::for_part(&part);
            service
                .create_part(&bucket, part, put_op(&backend, key, b"chunk"))
                .await
                .unwrap();
        }
        service.abort_upload(&bucket, "big.bin", "u-9").await.unwrap();

        let worker = MaintenanceWorker::new(service.clone(), backend.clone(), Duration::from_secs(60));
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.parts_purged, 2);
        assert_eq!(report.objects_purged, 1);
        assert!(service.get_deleted_parts().await.unwrap().is_empty());
        assert!(!dir.path().join(BUCKET).read_dir().unwrap().any(|_| true));
    }

    #[tokio::test]
    async fn spawned_worker_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn BackendStore> = Arc::new(FsBackend::new(dir.path()));
        let worker = MaintenanceWorker::new(service().await, backend, Duration::from_millis(10));
        let cancel = worker.spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn backend_failure_keeps_row_for_retry() {
        struct Refusing;

        #[async_trait::async_trait]
        impl BackendStore for Refusing {
            async fn put(&self, _: &BackendKey, _: BodyStream) -> Result<ContentReceipt, BackendError> {
                Err(BackendError::Rejected("read only".into()))
            }
            async fn get(&self, key: &BackendKey) -> Result<BodyStream, BackendError> {
                Err(BackendError::NotFound(key.name.clone()))
            }
            async fn delete(&self, _: &BackendKey) -> Result<(), BackendError> {
                Err(BackendError::Rejected("read only".into()))
            }
            async fn copy(&self, _: &BackendKey, _: &BackendKey) -> Result<ContentReceipt, BackendError> {
                Err(BackendError::Rejected("read only".into()))
            }
        }

        let service = service().await;
        let bucket = bucket(VersioningStatus::Disabled);
        service
            .create(&bucket, ObjectRecord::initialize(BUCKET, "x"), |_| rejected())
            .await
            .unwrap_err();

        let worker = MaintenanceWorker::new(service.clone(), Arc::new(Refusing), Duration::from_secs(60));
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(report.objects_purged, 0);
        assert_eq!(service.get_failed_or_deleted().await.unwrap().len(), 1);
    }
}
