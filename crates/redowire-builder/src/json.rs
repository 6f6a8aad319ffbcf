//! JSON rendering of builder events, and the file writer target.
//!
//! One JSON document per line; the shape mirrors what downstream
//! consumers and the golden-output tests expect:
//!
//! ```text
//! {"op":"begin","xid":"0x0001.000.0000002a","scn":110,"thread":1}
//! {"op":"c","scn":105,"commit-scn":110,"xid":"...","thread":1,
//!  "owner":"OLTP","table":"ORDERS","before":{},"after":{"ID":1,...}}
//! {"op":"commit","xid":"...","scn":110}
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use redowire_error::Result;
use redowire_types::value::DbTimezone;
use redowire_types::FieldValue;
use serde_json::{json, Map, Value};
use tracing::{error, info};

use crate::{Builder, BuilderEvent, ColumnOut, ConfirmedScn, MemoryBuilder};

/// Formatting knobs from the `format` config section the core treats as
/// opaque.
#[derive(Debug, Clone)]
pub struct JsonFormat {
    pub db_timezone: DbTimezone,
    /// Emit SCNs as numbers (`scn: 1`) instead of strings.
    pub numeric_scn: bool,
}

impl Default for JsonFormat {
    fn default() -> Self {
        Self {
            db_timezone: DbTimezone::UTC,
            numeric_scn: true,
        }
    }
}

impl JsonFormat {
    fn scn(&self, scn: redowire_types::Scn) -> Value {
        if self.numeric_scn {
            json!(scn.get())
        } else {
            json!(scn.get().to_string())
        }
    }

    fn value(&self, value: &FieldValue) -> Value {
        match value {
            FieldValue::Null => Value::Null,
            // serde_json runs with arbitrary_precision, so the exact
            // decimal string from the NUMBER decoder passes through
            // digit for digit. The fallback covers degraded values that
            // are not numeric literals at all.
            FieldValue::Number(text) => match serde_json::from_str::<serde_json::Number>(text) {
                Ok(n) => Value::Number(n),
                Err(_) => Value::String(text.clone()),
            },
            FieldValue::Text(text) => Value::String(text.clone()),
            FieldValue::Raw(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                Value::String(hex)
            }
            FieldValue::Timestamp(ts) => {
                Value::String(self.db_timezone.localize(*ts).to_rfc3339())
            }
            FieldValue::TimestampTz(ts) => Value::String(ts.to_rfc3339()),
        }
    }

    fn columns(&self, columns: &[ColumnOut]) -> Value {
        let mut map = Map::new();
        for column in columns {
            map.insert(column.name.clone(), self.value(&column.value));
        }
        Value::Object(map)
    }

    /// Render one event as a single JSON line (no trailing newline).
    #[must_use]
    pub fn line(&self, event: &BuilderEvent) -> String {
        let value = match event {
            BuilderEvent::Begin {
                xid,
                commit_scn,
                thread,
            } => json!({
                "op": "begin",
                "xid": xid.to_string(),
                "scn": self.scn(*commit_scn),
                "thread": thread.get(),
            }),
            BuilderEvent::Commit { xid, commit_scn } => json!({
                "op": "commit",
                "xid": xid.to_string(),
                "scn": self.scn(*commit_scn),
            }),
            BuilderEvent::Row(row) => json!({
                "op": row.op.tag().to_string(),
                "scn": self.scn(row.scn),
                "commit-scn": self.scn(row.commit_scn),
                "xid": row.xid.to_string(),
                "thread": row.thread.get(),
                "owner": row.owner,
                "table": row.table,
                "before": self.columns(&row.before),
                "after": self.columns(&row.after),
            }),
        };
        value.to_string()
    }
}

/// File writer: drains a builder queue onto disk, one JSON line per
/// event, reporting progress through [`ConfirmedScn`].
pub struct FileWriter {
    thread: Option<JoinHandle<()>>,
    pub confirmed: Arc<ConfirmedScn>,
}

impl FileWriter {
    /// Spawn the writer thread. `append` keeps existing output.
    pub fn spawn(
        output: PathBuf,
        append: bool,
        format: JsonFormat,
        receiver: Receiver<BuilderEvent>,
    ) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&output)?;
        let confirmed = ConfirmedScn::new();
        let thread_confirmed = Arc::clone(&confirmed);
        let thread = std::thread::Builder::new()
            .name("writer-file".to_owned())
            .spawn(move || {
                let mut file = std::io::BufWriter::new(file);
                for event in receiver.iter() {
                    let line = format.line(&event);
                    if let Err(e) = writeln!(file, "{line}") {
                        error!(error = %e, "file writer failed, dropping output");
                        return;
                    }
                    if let BuilderEvent::Commit { commit_scn, .. } = &event {
                        if file.flush().is_ok() {
                            thread_confirmed.confirm(*commit_scn);
                        }
                    }
                }
                let _ = file.flush();
                info!(path = %output.display(), "file writer drained");
            })
            .expect("spawning writer thread");
        Ok(Self {
            thread: Some(thread),
            confirmed,
        })
    }

    /// Wait for the writer to drain (the queue sender must be dropped
    /// first).
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Render a memory capture the way the file writer would, for golden
/// comparisons in tests.
#[must_use]
pub fn render_lines(builder: &MemoryBuilder, format: &JsonFormat) -> Vec<String> {
    builder.events.iter().map(|e| format.line(e)).collect()
}

/// Drain helper for writers embedded in-process (no thread).
pub fn write_all<W: Write>(
    receiver: &Receiver<BuilderEvent>,
    format: &JsonFormat,
    out: &mut W,
) -> Result<()> {
    for event in receiver.try_iter() {
        writeln!(out, "{}", format.line(&event))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{QueueBuilder, RowEvent};
    use redowire_types::{RedoThread, RowOpKind, Scn, Xid};

    fn row() -> BuilderEvent {
        BuilderEvent::Row(Box::new(RowEvent {
            op: RowOpKind::Insert,
            scn: Scn::new(105),
            commit_scn: Scn::new(110),
            xid: Xid::new(1, 0, 42),
            thread: RedoThread::ONE,
            owner: "OLTP".to_owned(),
            table: "ORDERS".to_owned(),
            before: vec![],
            after: vec![
                ColumnOut {
                    name: "ID".to_owned(),
                    value: FieldValue::Number("1".to_owned()),
                },
                ColumnOut {
                    name: "NAME".to_owned(),
                    value: FieldValue::Text("Alice".to_owned()),
                },
                ColumnOut {
                    name: "NOTE".to_owned(),
                    value: FieldValue::Null,
                },
            ],
            lwn_idx: 0,
        }))
    }

    #[test]
    fn row_line_shape() {
        let line = JsonFormat::default().line(&row());
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["op"], "c");
        assert_eq!(parsed["scn"], 105);
        assert_eq!(parsed["commit-scn"], 110);
        assert_eq!(parsed["after"]["ID"], 1);
        assert_eq!(parsed["after"]["NAME"], "Alice");
        assert!(parsed["after"]["NOTE"].is_null());
        assert_eq!(parsed["xid"], "0x0001.000.0000002a");
    }

    #[test]
    fn number_values_stay_numeric() {
        let format = JsonFormat::default();
        assert_eq!(format.value(&FieldValue::Number("1.5".to_owned())), json!(1.5));
        assert_eq!(format.value(&FieldValue::Number("-3".to_owned())), json!(-3));
        assert_eq!(
            format.value(&FieldValue::Number("0.0005".to_owned())),
            json!(0.0005)
        );
    }

    #[test]
    fn long_numbers_keep_every_digit() {
        let format = JsonFormat::default();
        // Oracle NUMBER goes to 38 significant digits; none may round
        // away through the output path.
        for literal in [
            "12345678901234567890123456789012345678",
            "-99999999999999999999999999999999999999",
            "0.12345678901234567890123456789012345678",
            "98765432109876543210.1234567890123456789",
        ] {
            let value = format.value(&FieldValue::Number(literal.to_owned()));
            assert!(value.is_number(), "literal {literal} must stay numeric");
            assert_eq!(value.to_string(), literal);
        }
    }

    #[test]
    fn raw_renders_as_hex() {
        let format = JsonFormat::default();
        assert_eq!(
            format.value(&FieldValue::Raw(vec![0xde, 0xad])),
            json!("dead")
        );
    }

    #[test]
    fn file_writer_writes_lines_and_confirms() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.json");
        let (mut builder, receiver) = QueueBuilder::new(16);
        let writer =
            FileWriter::spawn(output.clone(), false, JsonFormat::default(), receiver).unwrap();

        builder.emit(row()).unwrap();
        builder
            .emit(BuilderEvent::Commit {
                xid: Xid::new(1, 0, 42),
                commit_scn: Scn::new(110),
            })
            .unwrap();
        drop(builder);
        let confirmed = Arc::clone(&writer.confirmed);
        writer.join();

        let text = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"op\":\"c\""));
        assert_eq!(confirmed.get(), Scn::new(110));
    }
}
