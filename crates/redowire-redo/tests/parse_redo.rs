//! End-to-end parser tests: synthetic redo files through the real
//! reader/parser pair into a memory builder.

use std::path::PathBuf;
use std::sync::Arc;

use redowire_builder::flush::FlushOptions;
use redowire_builder::{BuilderEvent, MemoryBuilder, Metrics};
use redowire_metadata::schema::{SchemaSeed, SchemaSnapshot, TableFilter};
use redowire_metadata::{DbParams, Metadata, StartOptions};
use redowire_redo::fixture::{
    col_number, col_text, record_begin, record_checkpoint, record_commit, record_delete,
    record_end, record_insert, record_multi_insert, record_savepoint_mark,
    record_savepoint_rollback, record_unknown, record_update, GroupSpec, RedoFileSpec,
};
use redowire_redo::parser::{ParseCx, ParseOutcome, Parser};
use redowire_redo::reader::{Reader, ReaderConfig};
use redowire_txn::{MemoryLimits, TransactionBuffer};
use redowire_types::{Cx, FileOffset, RedoThread, RowLocator, RowOpKind, Scn, Seq, Xid};

const OBJ: u32 = 70001;

fn schema() -> Arc<SchemaSnapshot> {
    let seed: SchemaSeed = serde_json::from_str(
        r#"{
            "database": "TEST",
            "scn": 1,
            "tables": [{
                "owner": "OLTP", "table": "T", "obj": 70001,
                "columns": [
                    {"name": "ID", "type": "number"},
                    {"name": "NAME", "type": "varchar2"},
                    {"name": "VAL", "type": "number"}
                ]
            }]
        }"#,
    )
    .unwrap();
    Arc::new(SchemaSnapshot::from_seed(seed, &TableFilter::default()))
}

fn loc(slot: u16) -> RowLocator {
    RowLocator {
        obj: OBJ,
        block: 64,
        slot,
    }
}

struct Rig {
    cx: Arc<Cx>,
    metadata: Metadata,
    txn: TransactionBuffer,
    builder: MemoryBuilder,
    metrics: Arc<Metrics>,
}

impl Rig {
    fn new() -> Self {
        let metadata = Metadata::new(
            DbParams {
                database: "TEST".to_owned(),
                ..DbParams::default()
            },
            StartOptions::default(),
            PathBuf::from("/tmp"),
            3,
        );
        metadata.set_schema(schema());
        Self {
            cx: Arc::new(Cx::default()),
            metadata,
            txn: TransactionBuffer::new(MemoryLimits {
                min_mb: 1,
                max_mb: 8,
            }),
            builder: MemoryBuilder::new(),
            metrics: Metrics::new(),
        }
    }

    fn parse_file(&mut self, spec: &RedoFileSpec, dir: &std::path::Path) -> ParseOutcome {
        self.try_parse_file(spec, dir).unwrap()
    }

    fn try_parse_file(
        &mut self,
        spec: &RedoFileSpec,
        dir: &std::path::Path,
    ) -> redowire_error::Result<ParseOutcome> {
        let path = dir.join(format!("t{}_s{}.arc", spec.thread, spec.sequence));
        spec.write(&path).unwrap();
        let reader = Reader::spawn(Arc::clone(&self.cx), 0, ReaderConfig::default());
        let mut parser = Parser::new(0, path, spec.thread, spec.sequence);
        self.metadata
            .set_current_position(spec.sequence, FileOffset::ZERO);
        let mut pcx = ParseCx {
            cx: &self.cx,
            metadata: &self.metadata,
            txn: &mut self.txn,
            builder: &mut self.builder,
            metrics: &self.metrics,
            flush_options: FlushOptions::default(),
        };
        parser.parse(&mut pcx, &reader)
    }

    fn ops(&self) -> Vec<(RowOpKind, u64)> {
        self.builder
            .rows()
            .iter()
            .map(|r| (r.op, r.commit_scn.get()))
            .collect()
    }
}

#[test]
fn single_transaction_crud() {
    let dir = tempfile::tempdir().unwrap();
    let xid = Xid::new(1, 0, 1);
    let x2 = Xid::new(1, 0, 2);
    let x3 = Xid::new(1, 0, 3);

    let spec = RedoFileSpec::sealed(RedoThread::ONE, Seq::new(1), 100, 200)
        .group(
            GroupSpec::new(100)
                .record(record_begin(xid, 100))
                .record(record_insert(
                    xid,
                    101,
                    loc(1),
                    vec![col_number(0, "1"), col_text(1, "Alice"), col_number(2, "100")],
                ))
                .record(record_insert(
                    xid,
                    102,
                    loc(2),
                    vec![col_number(0, "2"), col_text(1, "Bob"), col_number(2, "200")],
                ))
                .record(record_commit(xid, 110)),
        )
        .group(
            GroupSpec::new(120)
                .record(record_begin(x2, 120))
                .record(record_update(
                    x2,
                    121,
                    loc(1),
                    vec![col_number(0, "1"), col_text(1, "Alice"), col_number(2, "100")],
                    vec![col_number(2, "150")],
                ))
                .record(record_commit(x2, 130)),
        )
        .group(
            GroupSpec::new(140)
                .record(record_begin(x3, 140))
                .record(record_delete(
                    x3,
                    141,
                    loc(2),
                    vec![col_number(0, "2"), col_text(1, "Bob"), col_number(2, "200")],
                ))
                .record(record_commit(x3, 150)),
        );

    let mut rig = Rig::new();
    let outcome = rig.parse_file(&spec, dir.path());
    assert_eq!(outcome, ParseOutcome::Finished);

    assert_eq!(
        rig.ops(),
        vec![
            (RowOpKind::Insert, 110),
            (RowOpKind::Insert, 110),
            (RowOpKind::Update, 130),
            (RowOpKind::Delete, 150),
        ]
    );

    let rows = rig.builder.rows();
    let update = rows[2];
    assert_eq!(update.before[2].name, "VAL");
    assert_eq!(
        update.before[2].value,
        redowire_types::FieldValue::Number("100".to_owned())
    );
    assert_eq!(
        update.after[2].value,
        redowire_types::FieldValue::Number("150".to_owned())
    );
    // The full after row is materialized, unchanged columns included.
    assert_eq!(
        update.after[1].value,
        redowire_types::FieldValue::Text("Alice".to_owned())
    );

    let delete = rows[3];
    assert_eq!(
        delete.before[1].value,
        redowire_types::FieldValue::Text("Bob".to_owned())
    );
    assert!(delete.after.is_empty());

    assert_eq!(rig.txn.live_len(), 0);
    assert_eq!(rig.txn.arena().in_use(), 0);
}

#[test]
fn savepoint_partial_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let xid = Xid::new(1, 0, 5);
    let spec = RedoFileSpec::sealed(RedoThread::ONE, Seq::new(1), 100, 200).group(
        GroupSpec::new(100)
            .record(record_begin(xid, 100))
            .record(record_insert(xid, 101, loc(5), vec![col_number(0, "5"), col_text(1, "a")]))
            .record(record_savepoint_mark(xid, 102, 1))
            .record(record_insert(xid, 103, loc(6), vec![col_number(0, "6"), col_text(1, "b")]))
            .record(record_savepoint_rollback(xid, 104, 1))
            .record(record_insert(xid, 105, loc(7), vec![col_number(0, "7"), col_text(1, "c")]))
            .record(record_commit(xid, 110)),
    );

    let mut rig = Rig::new();
    assert_eq!(rig.parse_file(&spec, dir.path()), ParseOutcome::Finished);

    let rows = rig.builder.rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[0].after[0].value,
        redowire_types::FieldValue::Number("5".to_owned())
    );
    assert_eq!(
        rows[1].after[0].value,
        redowire_types::FieldValue::Number("7".to_owned())
    );
}

#[test]
fn rolled_back_transaction_is_invisible() {
    let dir = tempfile::tempdir().unwrap();
    let xid = Xid::new(1, 0, 6);
    let spec = RedoFileSpec::sealed(RedoThread::ONE, Seq::new(1), 100, 200).group(
        GroupSpec::new(100)
            .record(record_begin(xid, 100))
            .record(record_insert(xid, 101, loc(1), vec![col_number(0, "1")]))
            .record(record_end(xid, 110, true, false)),
    );

    let mut rig = Rig::new();
    assert_eq!(rig.parse_file(&spec, dir.path()), ParseOutcome::Finished);
    assert!(rig.builder.events.is_empty());
    assert_eq!(rig.txn.arena().in_use(), 0);
    assert_eq!(
        rig.metrics.snapshot(0, 0).transactions_rollback_out,
        1
    );
}

#[test]
fn transaction_spanning_log_switch() {
    let dir = tempfile::tempdir().unwrap();
    let xid = Xid::new(1, 0, 7);

    let first = RedoFileSpec::sealed(RedoThread::ONE, Seq::new(1), 100, 200).group(
        GroupSpec::new(100)
            .record(record_begin(xid, 100))
            .record(record_insert(xid, 101, loc(1), vec![col_number(0, "1")]))
            .record(record_insert(xid, 102, loc(2), vec![col_number(0, "2")]))
            .record(record_insert(xid, 103, loc(3), vec![col_number(0, "3")])),
    );
    let second = RedoFileSpec::sealed(RedoThread::ONE, Seq::new(2), 200, 300).group(
        GroupSpec::new(200)
            .record(record_insert(xid, 201, loc(4), vec![col_number(0, "4")]))
            .record(record_insert(xid, 202, loc(5), vec![col_number(0, "5")]))
            .record(record_update(
                xid,
                203,
                loc(1),
                vec![col_number(0, "1")],
                vec![col_number(0, "10")],
            ))
            .record(record_delete(xid, 204, loc(3), vec![col_number(0, "3")]))
            .record(record_commit(xid, 210)),
    );

    let mut rig = Rig::new();
    assert_eq!(rig.parse_file(&first, dir.path()), ParseOutcome::Finished);
    // Nothing is emitted before the commit is observed.
    assert!(rig.builder.events.is_empty());
    assert_eq!(rig.txn.live_len(), 1);

    assert_eq!(rig.parse_file(&second, dir.path()), ParseOutcome::Finished);
    let ops = rig.ops();
    assert_eq!(ops.len(), 7);
    assert!(ops.iter().all(|&(_, commit)| commit == 210));
    assert_eq!(
        ops.iter().filter(|(op, _)| *op == RowOpKind::Insert).count(),
        5
    );
    assert_eq!(
        ops.iter().filter(|(op, _)| *op == RowOpKind::Update).count(),
        1
    );
    assert_eq!(
        ops.iter().filter(|(op, _)| *op == RowOpKind::Delete).count(),
        1
    );
}

#[test]
fn multi_insert_emits_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let xid = Xid::new(1, 0, 8);
    let spec = RedoFileSpec::sealed(RedoThread::ONE, Seq::new(1), 100, 200).group(
        GroupSpec::new(100)
            .record(record_begin(xid, 100))
            .record(record_multi_insert(
                xid,
                101,
                OBJ,
                64,
                vec![
                    (1, vec![col_number(0, "1")]),
                    (2, vec![col_number(0, "2")]),
                    (3, vec![col_number(0, "3")]),
                ],
            ))
            .record(record_commit(xid, 110)),
    );

    let mut rig = Rig::new();
    assert_eq!(rig.parse_file(&spec, dir.path()), ParseOutcome::Finished);
    assert_eq!(rig.builder.rows().len(), 3);
}

#[test]
fn checkpoint_only_group_advances_lwn_scn() {
    let dir = tempfile::tempdir().unwrap();
    let spec = RedoFileSpec::sealed(RedoThread::ONE, Seq::new(1), 100, 400)
        .group(GroupSpec::new(250).record(record_checkpoint(250)))
        .group(GroupSpec::new(350).record(record_checkpoint(350)));

    let mut rig = Rig::new();
    let path = dir.path().join("t1_s1.arc");
    spec.write(&path).unwrap();
    let reader = Reader::spawn(Arc::clone(&rig.cx), 0, ReaderConfig::default());
    let mut parser = Parser::new(0, path, RedoThread::ONE, Seq::new(1));
    rig.metadata.set_current_position(Seq::new(1), FileOffset::ZERO);
    let mut pcx = ParseCx {
        cx: &rig.cx,
        metadata: &rig.metadata,
        txn: &mut rig.txn,
        builder: &mut rig.builder,
        metrics: &rig.metrics,
        flush_options: FlushOptions::default(),
    };
    assert_eq!(parser.parse(&mut pcx, &reader).unwrap(), ParseOutcome::Finished);
    assert_eq!(parser.lwn_scn(), Scn::new(350));
    assert!(rig.builder.events.is_empty());
}

#[test]
fn unknown_opcode_strict_raises_lenient_skips() {
    let dir = tempfile::tempdir().unwrap();
    let spec = RedoFileSpec::sealed(RedoThread::ONE, Seq::new(1), 100, 200)
        .group(GroupSpec::new(100).record(record_unknown(100)));

    let mut rig = Rig::new();
    let err = rig.try_parse_file(&spec, dir.path()).unwrap_err();
    assert!(matches!(
        err,
        redowire_error::RedowireError::UnknownOpcode { .. }
    ));

    let lenient = Metadata::new(
        DbParams {
            database: "TEST".to_owned(),
            disable_checks: redowire_types::DisableChecks(
                redowire_types::DisableChecks::STRICT_OPCODES,
            ),
            ..DbParams::default()
        },
        StartOptions::default(),
        PathBuf::from("/tmp"),
        3,
    );
    lenient.set_schema(schema());
    let mut rig = Rig::new();
    rig.metadata = lenient;
    assert_eq!(rig.parse_file(&spec, dir.path()), ParseOutcome::Finished);
}

#[test]
fn commit_boundaries_are_emitted() {
    let dir = tempfile::tempdir().unwrap();
    let xid = Xid::new(1, 0, 9);
    let spec = RedoFileSpec::sealed(RedoThread::ONE, Seq::new(1), 100, 200).group(
        GroupSpec::new(100)
            .record(record_begin(xid, 100))
            .record(record_insert(xid, 101, loc(1), vec![col_number(0, "1")]))
            .record(record_commit(xid, 110)),
    );

    let mut rig = Rig::new();
    rig.parse_file(&spec, dir.path());
    assert!(matches!(rig.builder.events[0], BuilderEvent::Begin { .. }));
    assert!(matches!(rig.builder.events[1], BuilderEvent::Row(_)));
    assert!(matches!(rig.builder.events[2], BuilderEvent::Commit { .. }));
}

#[test]
fn wrong_sequence_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let spec = RedoFileSpec::sealed(RedoThread::ONE, Seq::new(4), 100, 200)
        .group(GroupSpec::new(100).record(record_checkpoint(100)));
    let path = dir.path().join("t1_s4.arc");
    spec.write(&path).unwrap();

    let mut rig = Rig::new();
    let reader = Reader::spawn(Arc::clone(&rig.cx), 0, ReaderConfig::default());
    // The parser expects sequence 9; the file carries 4.
    let mut parser = Parser::new(0, path, RedoThread::ONE, Seq::new(9));
    rig.metadata.set_current_position(Seq::new(9), FileOffset::ZERO);
    let mut pcx = ParseCx {
        cx: &rig.cx,
        metadata: &rig.metadata,
        txn: &mut rig.txn,
        builder: &mut rig.builder,
        metrics: &rig.metrics,
        flush_options: FlushOptions::default(),
    };
    assert!(matches!(
        parser.parse(&mut pcx, &reader),
        Err(redowire_error::RedowireError::WrongSequence { .. })
    ));
}

#[test]
fn shutdown_marker_commit_requests_stop() {
    let dir = tempfile::tempdir().unwrap();
    let xid = Xid::new(1, 0, 10);
    let spec = RedoFileSpec::sealed(RedoThread::ONE, Seq::new(1), 100, 200).group(
        GroupSpec::new(100)
            .record(record_begin(xid, 100))
            .record(record_insert(xid, 101, loc(1), vec![col_number(0, "1")]))
            .record(record_end(xid, 110, false, true)),
    );

    let mut rig = Rig::new();
    rig.metadata.set_first_data_scn(Scn::ZERO);
    let _ = rig.parse_file(&spec, dir.path());
    assert!(rig.cx.is_soft_shutdown());
}
