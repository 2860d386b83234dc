/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Human readable listing of a dump file.

use std::io::Write;

use anyhow::Result;
use emd_proto::DecodeError;
use emd_proto::EventKind;
use emd_proto::Record;
use emd_proto::RecordReader;
use syscalls::Sysno;

/// Totals over a listed dump.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Totals {
    pub records: usize,
    pub syscalls: usize,
    pub events: usize,
    /// Where decoding stopped, if the dump is damaged or truncated.
    pub error: Option<DecodeError>,
}

fn kind_name(kind: EventKind) -> String {
    match kind {
        EventKind::Syscall(nr) => match Sysno::new(nr as usize) {
            Some(sysno) => sysno.name().to_owned(),
            None => format!("syscall_{}", nr),
        },
        EventKind::Dbus(1) => "dbus:method_call".to_owned(),
        EventKind::Dbus(2) => "dbus:method_return".to_owned(),
        EventKind::Dbus(3) => "dbus:error".to_owned(),
        EventKind::Dbus(4) => "dbus:signal".to_owned(),
        other => other.to_string(),
    }
}

fn write_record<W: Write>(out: &mut W, record: &Record<'_>) -> Result<()> {
    let header = &record.header;
    write!(
        out,
        "{:>10}.{:09} {:<20} tid={:<6} len={}",
        header.time.sec,
        header.time.nsec,
        kind_name(record.kind()),
        header.tid,
        record.len
    )?;
    if let Some(thread) = record.threads.first() {
        write!(out, " stack={}", thread.stack.data.len())?;
    }
    if !record.heap.is_empty() {
        let bytes: usize = record.heap.iter().map(|r| r.data.len()).sum();
        write!(out, " heap={}/{}", record.heap.len(), bytes)?;
    }
    if record.kind().is_simple() {
        let payload = record.payload();
        let text = String::from_utf8_lossy(payload);
        write!(out, " {:?}", text)?;
    } else if let Some(result) = record.result() {
        write!(out, " = {}", result)?;
    }
    writeln!(out)?;
    Ok(())
}

/// Writes one line per record of `dump` to `out`. Decoding stops at the
/// first malformed record.
pub fn summarize<W: Write>(dump: &[u8], pointer_width: usize, out: &mut W) -> Result<Totals> {
    let mut totals = Totals::default();
    for record in RecordReader::with_pointer_width(dump, pointer_width) {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                writeln!(out, "error: {}", err)?;
                totals.error = Some(err);
                break;
            }
        };
        write_record(out, &record)?;
        totals.records += 1;
        if record.kind().is_simple() {
            totals.events += 1;
        } else {
            totals.syscalls += 1;
        }
    }
    writeln!(
        out,
        "{} records: {} syscalls, {} events",
        totals.records, totals.syscalls, totals.events
    )?;
    Ok(totals)
}

#[cfg(test)]
mod test {
    use emd_proto::align4;
    use emd_proto::RecordHeader;
    use emd_proto::RecordSize;
    use emd_proto::RecordWriter;
    use emd_proto::Timestamp;
    use emd_proto::POINTER_SIZE;

    use super::*;

    fn record(buf: &mut Vec<u8>, event_type: u16, extra: &[u8]) {
        let start = buf.len();
        buf.resize(start + RecordSize::new(extra.len(), 8).get(), 0);
        let mut w = RecordWriter::new(buf, start);
        w.header(&RecordHeader {
            time: Timestamp { sec: 12, nsec: 5 },
            event_type,
            thread_num: 1,
            tid: 3,
            extra_size: align4(extra.len()) as u16,
        })
        .unwrap();
        w.extra(extra).unwrap();
        w.registers(3, &[0; 8], 0).unwrap();
        w.stack(0, 0).unwrap();
        w.heap_count(0).unwrap();
    }

    #[test]
    fn lists_records() {
        let mut dump = Vec::new();
        record(&mut dump, Sysno::close as u16, &(-9i64).to_ne_bytes());
        record(&mut dump, 0x2104, b"a->b,p=/,i=x,m=y;\0");

        let mut out = Vec::new();
        let totals = summarize(&dump, POINTER_SIZE, &mut out).unwrap();
        assert_eq!(totals.records, 2);
        assert_eq!(totals.syscalls, 1);
        assert_eq!(totals.events, 1);
        assert_eq!(totals.error, None);

        let out = String::from_utf8(out).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("close"));
        assert!(lines[0].ends_with("= -9"));
        assert!(lines[1].contains("dbus:signal"));
        assert!(lines[1].contains("a->b,p=/,i=x,m=y;"));
        assert_eq!(lines[2], "2 records: 1 syscalls, 1 events");
    }

    #[test]
    fn truncated_dump_is_reported() {
        let mut dump = Vec::new();
        record(&mut dump, Sysno::getpid as u16, &1i64.to_ne_bytes());
        dump.truncate(dump.len() - 3);

        let mut out = Vec::new();
        let totals = summarize(&dump, POINTER_SIZE, &mut out).unwrap();
        assert_eq!(totals.records, 0);
        assert!(totals.error.is_some());
    }
}
