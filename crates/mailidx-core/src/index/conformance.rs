//! Behaviour every backend must share, run against each built-in engine

use super::{rebuild, BackendRegistry, SearchBackend, SearchKey};
use chrono::{NaiveDate, TimeZone, Utc};
use mailidx_common::config::IndexConfig;
use mailidx_common::types::{
    FlagTarget, MailboxDescriptor, MailboxId, MailboxStatus, MessageDocument, OpenMode,
    Property, RebuildState, SequenceSet, Uid,
};
use mailidx_common::Error;
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const ENGINES: [&str; 2] = ["tantivy", "sqlite"];

struct Fixture {
    backend: Arc<dyn SearchBackend>,
    data_dir: PathBuf,
}

impl Fixture {
    async fn new(temp_dir: &TempDir, engine: &str) -> Self {
        let mut config = IndexConfig::default();
        config.engine = engine.to_string();
        config.data_dir = temp_dir.path().join(engine);
        config.tantivy.writer_heap_bytes = 20_000_000;

        let backend = BackendRegistry::global().create(&config).unwrap();
        backend.setup().await.unwrap();
        backend.standby().await.unwrap();
        backend.open(OpenMode::ReadWrite).await.unwrap();

        Self {
            backend,
            data_dir: config.data_dir,
        }
    }

    fn mailbox(&self, id: MailboxId) -> MailboxDescriptor {
        MailboxDescriptor {
            id,
            name: format!("box-{}", id),
            query: self.backend.default_query(id),
            last_peeked_uid: 0,
        }
    }

    fn old_index_path(&self) -> PathBuf {
        match self.backend.name() {
            "tantivy" => self.data_dir.join("tantivy.old"),
            _ => self.data_dir.join("index.db.old"),
        }
    }

    async fn add(&self, uid: Uid, mailbox_id: MailboxId, body: &str, flags: &str) {
        let doc = document(uid, mailbox_id, body, flags);
        self.backend
            .register(&doc, &format!("{}/{}", mailbox_id, uid))
            .await
            .unwrap();
    }

    async fn search(&self, mailbox: &MailboxDescriptor, keys: &[SearchKey]) -> Vec<Uid> {
        self.backend.search_by_keys(mailbox, keys).await.unwrap()
    }
}

fn document(uid: Uid, mailbox_id: MailboxId, body: &str, flags: &str) -> MessageDocument {
    let mut doc = MessageDocument::new(
        uid,
        mailbox_id,
        Utc.timestamp_opt(1_700_000_000 + uid as i64, 0).unwrap(),
    );
    doc.subject = format!("message {}", uid);
    doc.body = body.to_string();
    doc.size = body.len() as u64;
    doc.flags = flags.to_string();
    doc
}

fn set(s: &str) -> SequenceSet {
    SequenceSet::parse(s).unwrap()
}

fn body(s: &str) -> SearchKey {
    SearchKey::Body(s.to_string())
}

#[tokio::test]
async fn results_are_ordered_by_uid() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        for uid in [3, 1, 2] {
            fx.add(uid, 1, "text", "").await;
        }
        let inbox = fx.mailbox(1);

        assert_eq!(fx.search(&inbox, &[]).await, vec![1, 2, 3], "{}", engine);

        let items = fx.backend.fetch(&inbox, &set("1:*")).await.unwrap();
        let pairs: Vec<(u64, Uid)> = items.iter().map(|i| (i.sequence_number, i.uid)).collect();
        assert_eq!(pairs, vec![(1, 1), (2, 2), (3, 3)], "{}", engine);

        let items = fx.backend.uid_fetch(&inbox, &set("2:*")).await.unwrap();
        let uids: Vec<Uid> = items.iter().map(|i| i.uid).collect();
        assert_eq!(uids, vec![2, 3], "{}", engine);
    }
}

#[tokio::test]
async fn searches_stay_inside_the_mailbox() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        fx.add(1, 1, "apple pie", "").await;
        fx.add(2, 1, "banana split", "").await;
        fx.add(3, 2, "apple crumble", "").await;
        fx.add(4, 2, "cherry tart", "").await;
        let inbox = fx.mailbox(1);

        let or = SearchKey::or(body("apple"), body("cherry"));
        assert_eq!(fx.search(&inbox, &[or]).await, vec![1], "{}", engine);

        let not = SearchKey::not(body("apple"));
        assert_eq!(fx.search(&inbox, &[not]).await, vec![2], "{}", engine);

        let group = SearchKey::Group(vec![body("banana"), SearchKey::NoFlag("\\Seen".into())]);
        assert_eq!(fx.search(&inbox, &[group]).await, vec![2], "{}", engine);

        let nothing = SearchKey::not(SearchKey::All);
        assert!(fx.search(&inbox, &[nothing]).await.is_empty(), "{}", engine);
    }
}

#[tokio::test]
async fn status_counts_messages_unseen_and_recent() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        fx.add(1, 7, "one", "").await;
        fx.add(2, 7, "two", "\\Seen").await;
        fx.add(3, 7, "three", "\\Seen \\Answered").await;
        fx.add(4, 8, "elsewhere", "").await;

        let mut mailbox = fx.mailbox(7);
        let status = fx.backend.status(&mailbox).await.unwrap();
        assert_eq!(
            status,
            MailboxStatus {
                messages: 3,
                unseen: 1,
                recent: 3
            },
            "{}",
            engine
        );

        mailbox.last_peeked_uid = 1;
        assert_eq!(fx.backend.status(&mailbox).await.unwrap().recent, 2, "{}", engine);
    }
}

#[tokio::test]
async fn flags_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        fx.add(1, 1, "hello", "").await;
        fx.add(2, 1, "hello", "").await;
        let inbox = fx.mailbox(1);

        fx.backend
            .set_flags(FlagTarget::Uid(2), "\\Seen $Work")
            .await
            .unwrap();
        assert_eq!(
            fx.backend.get_flags(FlagTarget::Uid(2)).await.unwrap(),
            Some("\\Seen $Work".to_string()),
            "{}",
            engine
        );

        let seen = SearchKey::Flag("\\SEEN".to_string());
        assert_eq!(fx.search(&inbox, &[seen.clone()]).await, vec![2], "{}", engine);
        let keyword = SearchKey::Keyword("$work".to_string());
        assert_eq!(fx.search(&inbox, &[keyword]).await, vec![2], "{}", engine);

        // Re-indexing for a flag change must not disturb body search
        assert_eq!(fx.search(&inbox, &[body("hello")]).await, vec![1, 2], "{}", engine);

        fx.backend.delete_flags(FlagTarget::Uid(2)).await.unwrap();
        assert_eq!(
            fx.backend.get_flags(FlagTarget::Uid(2)).await.unwrap(),
            None,
            "{}",
            engine
        );
        assert!(fx.search(&inbox, &[seen]).await.is_empty(), "{}", engine);
        let unseen = SearchKey::NoFlag("\\Seen".to_string());
        assert_eq!(fx.search(&inbox, &[unseen]).await, vec![1, 2], "{}", engine);

        // Deleting again is a no-op
        fx.backend.delete_flags(FlagTarget::Uid(2)).await.unwrap();
        assert_eq!(fx.search(&inbox, &[body("hello")]).await, vec![1, 2], "{}", engine);
    }
}

#[tokio::test]
async fn delete_removes_document_and_flags() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        fx.add(1, 1, "keep", "\\Seen").await;
        fx.add(2, 1, "drop", "\\Seen").await;
        let inbox = fx.mailbox(1);

        let item = fx.backend.uid_fetch(&inbox, &set("2")).await.unwrap();
        assert_eq!(item.len(), 1, "{}", engine);
        assert_eq!(fx.backend.get_uid(item[0].item_id).await.unwrap(), 2, "{}", engine);

        fx.backend.delete(2, item[0].item_id).await.unwrap();
        assert_eq!(fx.search(&inbox, &[]).await, vec![1], "{}", engine);
        assert_eq!(
            fx.backend.get_flags(FlagTarget::Uid(2)).await.unwrap(),
            None,
            "{}",
            engine
        );
    }
}

#[tokio::test]
async fn setup_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        fx.add(1, 1, "persisted", "").await;
        fx.backend.close().await.unwrap();

        fx.backend.setup().await.unwrap();
        fx.backend.open(OpenMode::ReadWrite).await.unwrap();
        assert_eq!(fx.search(&fx.mailbox(1), &[]).await, vec![1], "{}", engine);
    }
}

#[tokio::test]
async fn uid_ranges() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        for uid in 1..=8 {
            fx.add(uid, 1, "x", "").await;
        }
        fx.add(9, 2, "x", "").await;
        let inbox = fx.mailbox(1);

        let open = SearchKey::Uid(set("5:*"));
        assert_eq!(fx.search(&inbox, &[open]).await, vec![5, 6, 7, 8], "{}", engine);

        let inverted = SearchKey::Uid(set("5:3"));
        assert!(fx.search(&inbox, &[inverted]).await.is_empty(), "{}", engine);

        let last = SearchKey::Uid(set("2,*"));
        assert_eq!(fx.search(&inbox, &[last]).await, vec![2, 8], "{}", engine);

        let items = fx.backend.uid_fetch(&inbox, &set("7:100")).await.unwrap();
        let uids: Vec<Uid> = items.iter().map(|i| i.uid).collect();
        assert_eq!(uids, vec![7, 8], "{}", engine);
    }
}

#[tokio::test]
async fn rebuild_preserves_flags() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        let docs = vec![
            document(1, 1, "first", ""),
            document(2, 1, "second", ""),
            document(3, 1, "third", "\\Answered"),
        ];
        for doc in &docs {
            fx.backend.register(doc, "loc").await.unwrap();
        }
        fx.backend
            .set_flags(FlagTarget::Uid(2), "\\Seen \\Flagged")
            .await
            .unwrap();

        let replay = docs.clone();
        rebuild(Arc::clone(&fx.backend), OpenMode::ReadWrite, |backend| async move {
            assert!(matches!(
                backend.rebuild_state(),
                RebuildState::Rebuilding
            ));
            for mut doc in replay {
                if let Some(flags) = backend.get_old_flags(doc.uid).await? {
                    doc.flags = flags;
                }
                backend.register(&doc, "loc").await?;
            }
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(fx.backend.rebuild_state(), RebuildState::Committed, "{}", engine);
        assert!(!fx.old_index_path().exists(), "{}", engine);
        assert_eq!(
            fx.backend.get_flags(FlagTarget::Uid(2)).await.unwrap(),
            Some("\\Seen \\Flagged".to_string()),
            "{}",
            engine
        );
        assert_eq!(
            fx.backend.get_flags(FlagTarget::Uid(3)).await.unwrap(),
            Some("\\Answered".to_string()),
            "{}",
            engine
        );
        assert_eq!(fx.search(&fx.mailbox(1), &[]).await, vec![1, 2, 3], "{}", engine);
        assert!(matches!(
            fx.backend.get_old_flags(2).await,
            Err(Error::NoOldIndex)
        ));
    }
}

#[tokio::test]
async fn rebuild_forgets_flags_of_dropped_messages() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        fx.add(1, 1, "kept", "\\Seen").await;
        fx.add(2, 1, "gone", "\\Flagged").await;

        rebuild(Arc::clone(&fx.backend), OpenMode::ReadWrite, |backend| async move {
            let mut doc = document(1, 1, "kept", "");
            if let Some(flags) = backend.get_old_flags(1).await? {
                doc.flags = flags;
            }
            backend.register(&doc, "loc").await?;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(
            fx.backend.get_flags(FlagTarget::Uid(1)).await.unwrap(),
            Some("\\Seen".to_string()),
            "{}",
            engine
        );
        assert_eq!(
            fx.backend.get_flags(FlagTarget::Uid(2)).await.unwrap(),
            None,
            "{}",
            engine
        );
        assert_eq!(fx.search(&fx.mailbox(1), &[]).await, vec![1], "{}", engine);
    }
}

#[tokio::test]
async fn failed_rebuild_leaves_partial_index_live() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        fx.add(1, 1, "one", "").await;
        fx.add(2, 1, "two", "").await;

        let result = rebuild(Arc::clone(&fx.backend), OpenMode::ReadWrite, |backend| async move {
            backend.register(&document(1, 1, "one", ""), "loc").await?;
            Err(Error::Internal("mail store vanished".to_string()))
        })
        .await;

        assert!(matches!(result, Err(Error::Internal(_))), "{}", engine);
        assert_eq!(fx.backend.rebuild_state(), RebuildState::RolledBack, "{}", engine);
        assert_eq!(fx.search(&fx.mailbox(1), &[]).await, vec![1], "{}", engine);

        // A later rebuild clears the leftover old index
        rebuild(Arc::clone(&fx.backend), OpenMode::ReadWrite, |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(!fx.old_index_path().exists(), "{}", engine);
    }
}

#[tokio::test]
async fn old_flags_need_a_rebuild() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        fx.add(1, 1, "x", "\\Seen").await;
        assert!(
            matches!(fx.backend.get_old_flags(1).await, Err(Error::NoOldIndex)),
            "{}",
            engine
        );
    }
}

#[tokio::test]
async fn duplicate_uid_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        fx.add(1, 1, "x", "").await;

        let result = fx.backend.register(&document(1, 2, "y", ""), "dup").await;
        assert!(matches!(result, Err(Error::Register(_))), "{}", engine);
    }
}

#[tokio::test]
async fn sequence_number_keys_are_not_implemented() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        let key = SearchKey::or(SearchKey::All, SearchKey::SequenceNumber(set("1:2")));

        let result = fx.backend.search_by_keys(&fx.mailbox(1), &[key]).await;
        assert!(matches!(result, Err(Error::NotImplemented(_))), "{}", engine);
    }
}

fn header(property: Property, value: &str) -> SearchKey {
    SearchKey::Header(property, value.to_string())
}

#[tokio::test]
async fn header_keys_match_substrings() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;

        let mut weekly = document(1, 1, "numbers", "");
        weekly.subject = "Weekly report".to_string();
        weekly.from = "alice@example.com".to_string();
        weekly.cc = "Team <team@lists.example.com>".to_string();
        let mut monthly = document(2, 1, "numbers", "");
        monthly.subject = "Monthly summary".to_string();
        monthly.from = "bob@example.org".to_string();
        let mut elsewhere = document(3, 2, "numbers", "");
        elsewhere.subject = "Weekly report".to_string();
        for doc in [&weekly, &monthly, &elsewhere] {
            fx.backend.register(doc, "loc").await.unwrap();
        }
        let inbox = fx.mailbox(1);

        let subject = header(Property::Subject, "eek");
        assert_eq!(fx.search(&inbox, &[subject.clone()]).await, vec![1], "{}", engine);
        assert_eq!(
            fx.search(&inbox, &[header(Property::From, "alice@exa")]).await,
            vec![1],
            "{}",
            engine
        );
        assert_eq!(
            fx.search(&inbox, &[header(Property::Subject, "WEEKLY REP")]).await,
            vec![1],
            "{}",
            engine
        );
        assert_eq!(
            fx.search(&inbox, &[header(Property::Cc, "lists.example")]).await,
            vec![1],
            "{}",
            engine
        );
        assert_eq!(
            fx.search(&inbox, &[header(Property::From, "example")]).await,
            vec![1, 2],
            "{}",
            engine
        );
        assert!(
            fx.search(&inbox, &[header(Property::To, "alice")]).await.is_empty(),
            "{}",
            engine
        );
        assert_eq!(
            fx.search(&inbox, &[header(Property::Subject, "")]).await,
            vec![1, 2],
            "{}",
            engine
        );

        let not = SearchKey::not(subject.clone());
        assert_eq!(fx.search(&inbox, &[not]).await, vec![2], "{}", engine);
        let or = SearchKey::or(subject, header(Property::From, "bob@"));
        assert_eq!(fx.search(&inbox, &[or]).await, vec![1, 2], "{}", engine);
        let group = SearchKey::Group(vec![body("numbers"), header(Property::Subject, "mary")]);
        assert_eq!(fx.search(&inbox, &[group]).await, vec![2], "{}", engine);
    }
}

#[tokio::test]
async fn text_without_terms_matches_nothing() {
    let temp_dir = TempDir::new().unwrap();
    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;
        fx.add(1, 1, "hello world", "").await;
        fx.add(2, 1, "goodbye", "").await;
        let inbox = fx.mailbox(1);

        assert!(fx.search(&inbox, &[body("!!!")]).await.is_empty(), "{}", engine);
        assert!(
            fx.search(&inbox, &[header(Property::Subject, "!!!")]).await.is_empty(),
            "{}",
            engine
        );
        assert_eq!(
            fx.search(&inbox, &[SearchKey::not(body("!!!"))]).await,
            vec![1, 2],
            "{}",
            engine
        );
        assert_eq!(fx.search(&inbox, &[body("  ")]).await, vec![1, 2], "{}", engine);
    }
}

#[tokio::test]
async fn date_and_size_keys() {
    let temp_dir = TempDir::new().unwrap();
    let at = |y: i32, m: u32, d: u32, h: u32, min: u32, s: u32| {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    };

    for engine in ENGINES {
        let fx = Fixture::new(&temp_dir, engine).await;

        let mut early = document(1, 1, "a", "");
        early.internal_date = at(2024, 3, 9, 12, 0, 0);
        early.date = Some(at(2024, 3, 1, 8, 0, 0));
        early.size = 100;
        let mut midnight = document(2, 1, "b", "");
        midnight.internal_date = at(2024, 3, 10, 0, 0, 0);
        midnight.date = Some(at(2024, 3, 10, 23, 59, 59));
        midnight.size = 500;
        let mut late = document(3, 1, "c", "");
        late.internal_date = at(2024, 3, 11, 9, 0, 0);
        late.date = None;
        late.size = 1000;
        for doc in [&early, &midnight, &late] {
            fx.backend.register(doc, "loc").await.unwrap();
        }
        let inbox = fx.mailbox(1);
        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();

        let cases = [
            (SearchKey::Before(day), vec![1]),
            (SearchKey::On(day), vec![2]),
            (SearchKey::Since(day), vec![2, 3]),
            (SearchKey::SentBefore(day), vec![1]),
            (SearchKey::SentOn(day), vec![2]),
            (SearchKey::SentSince(day), vec![2]),
            (SearchKey::Larger(500), vec![3]),
            (SearchKey::Smaller(500), vec![1]),
            (SearchKey::Larger(99), vec![1, 2, 3]),
            (SearchKey::not(SearchKey::Larger(100)), vec![1]),
            (
                SearchKey::Group(vec![SearchKey::Since(day), SearchKey::Smaller(1000)]),
                vec![2],
            ),
        ];
        for (key, expected) in cases {
            assert_eq!(
                fx.search(&inbox, &[key.clone()]).await,
                expected,
                "{} {:?}",
                engine,
                key
            );
        }
    }
}
