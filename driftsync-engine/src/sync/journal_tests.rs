    use super::*;
    use sqlx::SqlitePool;

    async fn make_journal() -> ProgressJournal {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let journal = ProgressJournal::from_pool(pool);
        journal.init().await.unwrap();
        journal
    }

    #[tokio::test]
    async fn get_requires_all_three_key_components() {
        let journal = make_journal().await;
        let mut record = ResumeRecord::fresh(7, 1000, Some("fid".into()));
        record.chunk = 3;
        record.transfer_id = 42;
        record.error = 1;
        journal.put(&record).await.unwrap();

        let hit = journal.get(7, 1000, Some("fid")).await.unwrap();
        assert_eq!(hit, Some(record.clone()));

        // An edited source (different mtime or fingerprint) must not resume.
        assert_eq!(journal.get(7, 1001, Some("fid")).await.unwrap(), None);
        assert_eq!(journal.get(7, 1000, Some("other")).await.unwrap(), None);
        assert_eq!(journal.get(7, 1000, None).await.unwrap(), None);
        assert_eq!(journal.get(8, 1000, Some("fid")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn null_fingerprint_matches_null_only() {
        let journal = make_journal().await;
        let record = ResumeRecord::fresh(9, 500, None);
        journal.put(&record).await.unwrap();

        assert_eq!(journal.get(9, 500, None).await.unwrap(), Some(record));
        assert_eq!(journal.get(9, 500, Some("fid")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_upserts_and_delete_removes() {
        let journal = make_journal().await;
        let mut record = ResumeRecord::fresh(11, 1, None);
        record.error = 1;
        journal.put(&record).await.unwrap();

        record.error = 3;
        record.tmpfile = Some(".a.txt.x1y2z3.part".into());
        record.error_string = Some("write failed".into());
        journal.put(&record).await.unwrap();

        let hit = journal.get(11, 1, None).await.unwrap().unwrap();
        assert_eq!(hit.error, 3);
        assert_eq!(hit.tmpfile.as_deref(), Some(".a.txt.x1y2z3.part"));
        assert_eq!(hit.error_string.as_deref(), Some("write failed"));
        assert_eq!(journal.count().await.unwrap(), 1);

        journal.delete(11).await.unwrap();
        assert_eq!(journal.get(11, 1, None).await.unwrap(), None);
        assert_eq!(journal.count().await.unwrap(), 0);
    }
