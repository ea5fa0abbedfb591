#[cfg(test)]
mod integration_tests {
    use crate::{
        ArchiveBuilder, CatalogClient, CliRunner, Collaborators, CommandArchiveBuilder, Config,
        DwcTermMerger, ManualClock, Metrics, MockArchiveBuilder, NormalizedRequest, Notification,
        NotificationOutcome, Notifier, PackagerError, PackagerService, Page, RequestParameters,
        Row, SubmissionStatus,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, Semaphore};

    /// Serves `rows` numbered records for any resource.
    struct FakeCatalog {
        rows: u64,
        builds: AtomicUsize,
        delay: Option<Duration>,
        failing: bool,
        gate: Option<Arc<Semaphore>>,
        started: Option<mpsc::UnboundedSender<String>>,
    }

    impl FakeCatalog {
        fn new(rows: u64) -> Self {
            Self {
                rows,
                builds: AtomicUsize::new(0),
                delay: None,
                failing: false,
                gate: None,
                started: None,
            }
        }

        fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CatalogClient for FakeCatalog {
        async fn fetch_page(
            &self,
            request: &NormalizedRequest,
            offset: u64,
            limit: usize,
        ) -> Result<Page, PackagerError> {
            if offset == 0 {
                self.builds.fetch_add(1, Ordering::SeqCst);
                if let Some(started) = &self.started {
                    let _ = started.send(request.resource_id.clone());
                }
                if let Some(gate) = &self.gate {
                    gate.acquire().await.unwrap().forget();
                }
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing {
                return Err(PackagerError::FetchFailure("HTTP 503".to_string()));
            }
            if offset >= self.rows {
                return Ok(Page::EndOfData);
            }

            let end = (offset + limit as u64).min(self.rows);
            let rows = (offset..end)
                .map(|i| {
                    let mut row = Row::new();
                    row.insert("_id".to_string(), json!(i));
                    row.insert("catalogNumber".to_string(), json!(format!("NHM-{i}")));
                    row.insert("colour".to_string(), json!("red"));
                    row
                })
                .collect();
            Ok(Page::Rows(rows))
        }
    }

    /// "Archives" by copying the data file, counting every build.
    #[derive(Default)]
    struct CopyArchiver {
        builds: AtomicUsize,
    }

    #[async_trait]
    impl ArchiveBuilder for CopyArchiver {
        async fn create_archive(&self, input: &Path, output: &Path) -> Result<(), PackagerError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::fs::copy(input, output).await?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> Result<(), PackagerError> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn test_config(dir: &TempDir) -> Config {
        Config {
            workers: 2,
            requests_per_worker: 10,
            queue_capacity: 10,
            store_directory: dir.path().join("store"),
            temp_directory: dir.path().join("tmp"),
            page_size: 4,
            job_timeout: 30,
            ..Default::default()
        }
    }

    fn params(resource_id: &str, email: &str) -> RequestParameters {
        RequestParameters {
            resource_id: resource_id.to_string(),
            ckan_host: "https://data.nhm.ac.uk".to_string(),
            email: email.to_string(),
            ..Default::default()
        }
    }

    async fn start(
        config: Config,
        catalog: Arc<FakeCatalog>,
        archiver: Arc<dyn ArchiveBuilder>,
        notifier: Arc<RecordingNotifier>,
    ) -> PackagerService {
        let collaborators = Collaborators {
            catalog,
            merger: Arc::new(DwcTermMerger),
            archiver,
            notifier,
        };
        PackagerService::new(config, collaborators, Arc::new(Metrics::new()))
            .await
            .unwrap()
    }

    fn scratch_entries(config: &Config) -> usize {
        std::fs::read_dir(&config.temp_directory).unwrap().count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identical_requests_share_one_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = FakeCatalog::new(10);
        catalog.delay = Some(Duration::from_millis(50));
        let catalog = Arc::new(catalog);
        let archiver = Arc::new(CopyArchiver::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let service = Arc::new(
            start(test_config(&dir), catalog.clone(), archiver.clone(), notifier.clone()).await,
        );

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let service = service.clone();
                tokio::spawn(async move {
                    let submission = service
                        .submit(&params("05ff2255", &format!("user{i}@example.org")))
                        .unwrap();
                    let status = submission.status;
                    (status, submission.wait().await)
                })
            })
            .collect();

        let mut statuses = Vec::new();
        let mut outcomes = Vec::new();
        for task in tasks {
            let (status, outcome) = task.await.unwrap();
            statuses.push(status);
            outcomes.push(outcome.unwrap());
        }
        service.shutdown().await;

        assert_eq!(archiver.builds.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.builds(), 1);
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == SubmissionStatus::Queued)
                .count(),
            1
        );
        assert!(outcomes.iter().all(|entry| *entry == outcomes[0]));
        assert!(outcomes[0].archive_path.exists());

        let sent = notifier.sent();
        assert_eq!(sent.len(), 20);
        let emails: HashSet<&str> = sent.iter().map(|n| n.email.as_str()).collect();
        assert_eq!(emails.len(), 20);
        assert!(sent
            .iter()
            .all(|n| matches!(n.outcome, NotificationOutcome::Ready { .. })));
    }

    #[tokio::test]
    async fn test_archive_failure_leaves_no_entry_and_next_request_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let attempts = Arc::new(AtomicUsize::new(0));

        let mut archiver = MockArchiveBuilder::new();
        let seen = attempts.clone();
        archiver
            .expect_create_archive()
            .times(2)
            .returning(move |input, output| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(PackagerError::ArchiveFailure(
                        "zip exited with 12".to_string(),
                    ));
                }
                std::fs::copy(input, output)?;
                Ok(())
            });

        let notifier = Arc::new(RecordingNotifier::default());
        let service = start(
            config.clone(),
            Arc::new(FakeCatalog::new(3)),
            Arc::new(archiver),
            notifier.clone(),
        )
        .await;

        let first = service.submit(&params("05ff2255", "a@example.org")).unwrap();
        assert_eq!(first.status, SubmissionStatus::Queued);
        let outcome = first.wait().await;
        assert!(matches!(outcome, Err(PackagerError::ArchiveFailure(_))));
        assert!(service.store().is_empty());
        assert_eq!(scratch_entries(&config), 0);

        let second = service.submit(&params("05ff2255", "a@example.org")).unwrap();
        assert_eq!(second.status, SubmissionStatus::Queued);
        let entry = second.wait().await.unwrap();
        assert_eq!(service.store().len(), 1);
        assert!(entry.archive_path.exists());

        service.shutdown().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let outcomes: Vec<NotificationOutcome> =
            notifier.sent().into_iter().map(|n| n.outcome).collect();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], NotificationOutcome::Failed { .. }));
        assert!(matches!(outcomes[1], NotificationOutcome::Ready { .. }));
    }

    #[tokio::test]
    async fn test_cache_hit_is_served_without_rebuilding() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(FakeCatalog::new(5));
        let archiver = Arc::new(CopyArchiver::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let service = start(test_config(&dir), catalog.clone(), archiver.clone(), notifier.clone()).await;

        let built = service
            .submit(&params("05ff2255", "first@example.org"))
            .unwrap()
            .wait()
            .await
            .unwrap();

        let hit = service.submit(&params("05ff2255", "second@example.org")).unwrap();
        assert_eq!(hit.status, SubmissionStatus::CacheHit);
        assert_eq!(hit.fingerprint, built.fingerprint);
        assert_eq!(hit.wait().await.unwrap(), built);

        service.shutdown().await;
        assert_eq!(archiver.builds.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.builds(), 1);

        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        let second = sent
            .iter()
            .find(|n| n.email == "second@example.org")
            .unwrap();
        assert_eq!(
            second.outcome,
            NotificationOutcome::Ready {
                file_name: format!("{}.zip", built.fingerprint)
            }
        );
    }

    #[tokio::test]
    async fn test_expired_archive_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cache_time: 60,
            ..test_config(&dir)
        };
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let archiver = Arc::new(CopyArchiver::default());
        let collaborators = Collaborators {
            catalog: Arc::new(FakeCatalog::new(2)),
            merger: Arc::new(DwcTermMerger),
            archiver: archiver.clone(),
            notifier: Arc::new(RecordingNotifier::default()),
        };
        let service = PackagerService::with_clock(
            config,
            collaborators,
            Arc::new(Metrics::new()),
            clock.clone(),
        )
        .await
        .unwrap();

        let request = params("05ff2255", "a@example.org");
        service.submit(&request).unwrap().wait().await.unwrap();

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(
            service.submit(&request).unwrap().status,
            SubmissionStatus::CacheHit
        );

        clock.advance(chrono::Duration::seconds(31));
        let rebuilt = service.submit(&request).unwrap();
        assert_eq!(rebuilt.status, SubmissionStatus::Queued);
        rebuilt.wait().await.unwrap();

        service.shutdown().await;
        assert_eq!(archiver.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_new_builds_but_duplicates_still_join() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            workers: 1,
            queue_capacity: 1,
            ..test_config(&dir)
        };
        let gate = Arc::new(Semaphore::new(0));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let mut catalog = FakeCatalog::new(2);
        catalog.gate = Some(gate.clone());
        catalog.started = Some(started_tx);
        let notifier = Arc::new(RecordingNotifier::default());
        let service = start(
            config,
            Arc::new(catalog),
            Arc::new(CopyArchiver::default()),
            notifier.clone(),
        )
        .await;

        let running = service.submit(&params("running", "a@example.org")).unwrap();
        assert_eq!(started_rx.recv().await.unwrap(), "running");

        let queued = service.submit(&params("queued", "b@example.org")).unwrap();
        assert_eq!(queued.status, SubmissionStatus::Queued);

        let rejected = service.submit(&params("rejected", "c@example.org"));
        assert_eq!(
            rejected.unwrap_err(),
            PackagerError::QueueFull { capacity: 1 }
        );

        let joined = service.submit(&params("queued", "d@example.org")).unwrap();
        assert_eq!(joined.status, SubmissionStatus::Joined);
        assert_eq!(service.stats().jobs_in_flight, 2);
        assert_eq!(service.stats().pool.queued, 1);

        gate.add_permits(2);
        running.wait().await.unwrap();
        let queued = queued.wait().await.unwrap();
        assert_eq!(joined.wait().await.unwrap(), queued);

        service.shutdown().await;
        let emails: Vec<String> = notifier.sent().into_iter().map(|n| n.email).collect();
        assert_eq!(emails.len(), 3);
        assert!(!emails.contains(&"c@example.org".to_string()));
    }

    #[tokio::test]
    async fn test_worker_slots_retire_through_the_service() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            workers: 1,
            requests_per_worker: 2,
            ..test_config(&dir)
        };
        let service = start(
            config,
            Arc::new(FakeCatalog::new(1)),
            Arc::new(CopyArchiver::default()),
            Arc::new(RecordingNotifier::default()),
        )
        .await;

        for resource in ["first", "second", "third"] {
            service
                .submit(&params(resource, "a@example.org"))
                .unwrap()
                .wait()
                .await
                .unwrap();
        }
        service.shutdown().await;

        let stats = service.stats();
        assert_eq!(stats.pool.processed, 3);
        assert_eq!(stats.pool.retired, 1);
        assert_eq!(stats.pool.crashed, 0);
        assert_eq!(stats.cached_archives, 3);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(FakeCatalog::new(1));
        let service = start(
            test_config(&dir),
            catalog.clone(),
            Arc::new(CopyArchiver::default()),
            Arc::new(RecordingNotifier::default()),
        )
        .await;

        let result = service.submit(&params("05ff2255", "not-an-address"));
        assert!(matches!(result, Err(PackagerError::InvalidRequest(_))));

        let result = service.submit(&RequestParameters {
            format: "xlsx".to_string(),
            ..params("05ff2255", "a@example.org")
        });
        assert!(matches!(result, Err(PackagerError::InvalidRequest(_))));

        assert_eq!(service.stats().jobs_in_flight, 0);
        service.shutdown().await;
        assert_eq!(catalog.builds(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_and_timeout_clean_up_scratch_space() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            job_timeout: 1,
            ..test_config(&dir)
        };

        let mut failing = FakeCatalog::new(10);
        failing.failing = true;
        let notifier = Arc::new(RecordingNotifier::default());
        let service = start(
            config.clone(),
            Arc::new(failing),
            Arc::new(CopyArchiver::default()),
            notifier.clone(),
        )
        .await;
        let outcome = service
            .submit(&params("05ff2255", "a@example.org"))
            .unwrap()
            .wait()
            .await;
        assert!(matches!(outcome, Err(PackagerError::FetchFailure(_))));
        service.shutdown().await;
        assert_eq!(scratch_entries(&config), 0);
        assert!(matches!(
            notifier.sent()[0].outcome,
            NotificationOutcome::Failed { .. }
        ));

        let mut slow = FakeCatalog::new(10);
        slow.delay = Some(Duration::from_secs(5));
        let service = start(
            config.clone(),
            Arc::new(slow),
            Arc::new(CopyArchiver::default()),
            Arc::new(RecordingNotifier::default()),
        )
        .await;
        let outcome = service
            .submit(&params("05ff2255", "a@example.org"))
            .unwrap()
            .wait()
            .await;
        assert_eq!(outcome, Err(PackagerError::Timeout(Duration::from_secs(1))));
        assert!(service.store().is_empty());
        service.shutdown().await;
        assert_eq!(scratch_entries(&config), 0);
    }

    #[tokio::test]
    async fn test_dwc_request_is_merged_and_archived() {
        let dir = tempfile::tempdir().unwrap();
        let extension = dir.path().join("dwc_occurrence.xml");
        std::fs::write(
            &extension,
            r#"<extension name="Occurrence">
  <property group="Occurrence" name="catalogNumber"/>
  <property group="Record" name="dynamicProperties"/>
</extension>"#,
        )
        .unwrap();
        let config = Config {
            dwc_extension_paths: vec![extension],
            ..test_config(&dir)
        };

        let service = start(
            config,
            Arc::new(FakeCatalog::new(6)),
            Arc::new(CommandArchiveBuilder::new("cp {input} {output}").unwrap()),
            Arc::new(RecordingNotifier::default()),
        )
        .await;

        let entry = service
            .submit(&RequestParameters {
                format: "dwc".to_string(),
                ..params("05ff2255", "a@example.org")
            })
            .unwrap()
            .wait()
            .await
            .unwrap();
        service.shutdown().await;

        let archived = std::fs::read_to_string(&entry.archive_path).unwrap();
        let lines: Vec<&str> = archived.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "_id,catalogNumber,dynamicProperties");
        assert_eq!(lines[1], r#"0,NHM-0,"{""colour"":""red""}""#);
        assert_eq!(entry.size, archived.len() as u64);
    }

    #[tokio::test]
    async fn test_batch_larger_than_the_queue_is_fully_packaged() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            workers: 1,
            queue_capacity: 1,
            ..test_config(&dir)
        };
        let mut catalog = FakeCatalog::new(3);
        catalog.delay = Some(Duration::from_millis(10));
        let catalog = Arc::new(catalog);
        let notifier = Arc::new(RecordingNotifier::default());

        let requests = dir.path().join("requests.jsonl");
        let lines: Vec<String> = (0..8)
            .map(|i| serde_json::to_string(&params(&format!("resource-{i}"), "a@example.org")).unwrap())
            .collect();
        std::fs::write(&requests, lines.join("\n")).unwrap();

        let runner = CliRunner::new(config, Arc::new(Metrics::new())).with_collaborators(
            Collaborators {
                catalog: catalog.clone(),
                merger: Arc::new(DwcTermMerger),
                archiver: Arc::new(CopyArchiver::default()),
                notifier: notifier.clone(),
            },
        );

        let summary = runner.run_requests(&requests).await.unwrap();
        runner.shutdown().await;

        assert_eq!(summary.submitted, 8);
        assert_eq!(summary.rejected, 0);
        assert_eq!(summary.succeeded, 8);
        assert_eq!(catalog.builds(), 8);
        assert_eq!(notifier.sent().len(), 8);
    }
}
