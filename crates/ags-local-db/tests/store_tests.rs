//! Integration tests for the session, log and result stores.

use ags_local_db::{
    Database, Error, LogLevel, LogSource, LogStore, NewLogEntry, NewSession, ResultStore,
    SessionFilter, SessionStatus, SessionStore,
};

fn new_session(name: &str, project: &str) -> NewSession {
    NewSession {
        name: name.to_string(),
        project: project.to_string(),
        goal: "add hello()".to_string(),
        phase: "implementation".to_string(),
        result_kind: "diff".to_string(),
        target_files: None,
    }
}

fn insert(db: &Database, session: &NewSession) -> ags_local_db::Result<i64> {
    db.transaction(|conn| SessionStore::new(conn).insert(session))
}

#[test]
fn session_names_are_unique() {
    let db = Database::open_in_memory().unwrap();

    insert(&db, &new_session("agent-1", "proj")).unwrap();
    let err = insert(&db, &new_session("agent-1", "other")).unwrap_err();

    assert!(matches!(err, Error::DuplicateSession(ref name) if name == "agent-1"));
    let all = db
        .read(|conn| SessionStore::new(conn).list(&SessionFilter::default()))
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].project, "proj");
}

#[test]
fn new_session_starts_running_with_targets() {
    let db = Database::open_in_memory().unwrap();
    let mut session = new_session("doc-1", "proj");
    session.result_kind = "document".to_string();
    session.target_files = Some(vec!["SPEC.md".to_string()]);
    insert(&db, &session).unwrap();

    let record = db.read(|conn| SessionStore::new(conn).get("doc-1")).unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::AgentRunning);
    assert_eq!(record.target_files, Some(vec!["SPEC.md".to_string()]));
    assert!(record.ended_at.is_none());
    assert!(record.exit_code.is_none());
}

#[test]
fn status_never_leaves_terminal_state() {
    let db = Database::open_in_memory().unwrap();
    insert(&db, &new_session("s", "proj")).unwrap();

    db.transaction(|conn| {
        SessionStore::new(conn).update_status(
            "s",
            SessionStatus::AgentComplete,
            Some(1),
            Some("Agent failed with exit code 1"),
        )
    })
    .unwrap();
    db.transaction(|conn| {
        SessionStore::new(conn).update_status("s", SessionStatus::Done, None, None)
    })
    .unwrap();

    let err = db
        .transaction(|conn| {
            SessionStore::new(conn).update_status("s", SessionStatus::Error, None, Some("late"))
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    let record = db.read(|conn| SessionStore::new(conn).get("s")).unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Done);
    assert_eq!(record.exit_code, Some(1));
    assert_eq!(record.error_message.as_deref(), Some("Agent failed with exit code 1"));
    assert!(record.ended_at.is_some());
}

#[test]
fn status_cannot_regress() {
    let db = Database::open_in_memory().unwrap();
    insert(&db, &new_session("s", "proj")).unwrap();
    db.transaction(|conn| {
        SessionStore::new(conn).update_status("s", SessionStatus::AgentComplete, Some(0), None)
    })
    .unwrap();

    let err = db
        .transaction(|conn| {
            SessionStore::new(conn).update_status("s", SessionStatus::AgentRunning, None, None)
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[test]
fn updating_unknown_session_fails() {
    let db = Database::open_in_memory().unwrap();
    let err = db
        .transaction(|conn| {
            SessionStore::new(conn).update_status("missing", SessionStatus::Done, None, None)
        })
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
}

#[test]
fn list_filters_by_project_and_status() {
    let db = Database::open_in_memory().unwrap();
    insert(&db, &new_session("a", "p1")).unwrap();
    insert(&db, &new_session("b", "p1")).unwrap();
    insert(&db, &new_session("c", "p2")).unwrap();
    db.transaction(|conn| {
        SessionStore::new(conn).update_status("b", SessionStatus::Error, None, Some("boom"))
    })
    .unwrap();

    let p1 = db
        .read(|conn| SessionStore::new(conn).list(&SessionFilter::default().project("p1")))
        .unwrap();
    assert_eq!(p1.len(), 2);
    // newest first
    assert_eq!(p1[0].name, "b");

    let failed = db
        .read(|conn| {
            SessionStore::new(conn).list(&SessionFilter::default().status(SessionStatus::Error))
        })
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "b");

    let limited = db
        .read(|conn| SessionStore::new(conn).list(&SessionFilter::default().limit(1)))
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[test]
fn logs_read_back_in_timestamp_order() {
    let db = Database::open_in_memory().unwrap();
    insert(&db, &new_session("s", "proj")).unwrap();

    let entries = [
        NewLogEntry::info("third").at("2024-01-01T00:00:03.000000Z"),
        NewLogEntry::info("first").at("2024-01-01T00:00:01.000000Z"),
        NewLogEntry::message(LogLevel::Warn, "second")
            .at("2024-01-01T00:00:02.000000Z")
            .with_source(LogSource::System),
    ];
    for entry in &entries {
        db.transaction(|conn| LogStore::new(conn).insert("s", entry)).unwrap();
    }

    let logs = db.read(|conn| LogStore::new(conn).list_by_session("s")).unwrap();
    let messages: Vec<_> = logs.iter().filter_map(|l| l.message.as_deref()).collect();
    assert_eq!(messages, vec!["first", "second", "third"]);
    assert_eq!(logs[1].level, LogLevel::Warn);
    assert_eq!(logs[1].source, Some(LogSource::System));
    assert!(logs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[test]
fn logs_after_an_id_come_in_insertion_order() {
    let db = Database::open_in_memory().unwrap();
    insert(&db, &new_session("s", "proj")).unwrap();
    insert(&db, &new_session("other", "proj")).unwrap();

    let append = |session: &str, entry: NewLogEntry| {
        db.transaction(|conn| LogStore::new(conn).insert(session, &entry))
            .unwrap()
    };
    let first = append("s", NewLogEntry::info("first").at("2024-01-01T00:00:05.000000Z"));
    append("other", NewLogEntry::info("elsewhere"));
    append("s", NewLogEntry::info("hook event").at("2024-01-01T00:00:01.000000Z"));
    let last = append("s", NewLogEntry::info("latest"));

    let newer = db.read(|conn| LogStore::new(conn).list_after("s", first)).unwrap();
    let messages: Vec<_> = newer.iter().filter_map(|l| l.message.as_deref()).collect();
    assert_eq!(messages, vec!["hook event", "latest"]);

    let none = db.read(|conn| LogStore::new(conn).list_after("s", last)).unwrap();
    assert!(none.is_empty());
    let all = db.read(|conn| LogStore::new(conn).list_after("s", 0)).unwrap();
    assert_eq!(all.len(), 3);
}

#[test]
fn results_are_upserted_per_phase() {
    let db = Database::open_in_memory().unwrap();
    insert(&db, &new_session("s", "proj")).unwrap();

    db.transaction(|conn| {
        ResultStore::new(conn).upsert("s", "implementation", "diff", "old", None, None)
    })
    .unwrap();
    let metadata = serde_json::json!({ "quality_score": 100 });
    db.transaction(|conn| {
        ResultStore::new(conn).upsert("s", "implementation", "diff", "new", None, Some(&metadata))
    })
    .unwrap();
    db.transaction(|conn| {
        ResultStore::new(conn).upsert(
            "s",
            "quality_check",
            "quality",
            "Quality Score: 100",
            None,
            None,
        )
    })
    .unwrap();

    let result = db
        .read(|conn| ResultStore::new(conn).get("s", "implementation"))
        .unwrap()
        .unwrap();
    assert_eq!(result.content, "new");
    assert_eq!(result.metadata, Some(metadata));

    let all = db.read(|conn| ResultStore::new(conn).list_by_session("s")).unwrap();
    assert_eq!(all.len(), 2);
    assert!(db
        .read(|conn| ResultStore::new(conn).get("s", "requirements"))
        .unwrap()
        .is_none());
}

#[test]
fn reopening_file_database_keeps_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agents.db");

    {
        let db = Database::open(&path).unwrap();
        insert(&db, &new_session("persisted", "proj")).unwrap();
    }

    let db = Database::open(&path).unwrap();
    let record = db.read(|conn| SessionStore::new(conn).get("persisted")).unwrap();
    assert!(record.is_some());
}
