//! Post-parse enhancement
//!
//! A pure pass over a freshly parsed document: lifts the message
//! timestamp (MSH-7) and control id (MSH-10) into metadata, and
//! preserves sub-day birth-time precision (PID-7) that the structural
//! mapping would otherwise truncate to a date.

use crate::hl7::field_value;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use relay_document::{Document, Node, NodeType, Value};
use tracing::debug;

/// Enhance a parsed document. The input is not mutated; the result is a
/// new document with the same report id.
pub fn enhance(document: &Document) -> Document {
    let mut enhanced = document.clone();

    if let Some(msh) = document.root.find_child("MSH") {
        if let Some(ts) = field_value(msh, 7).and_then(|t| parse_hl7_timestamp(&t)) {
            enhanced.metadata.message_timestamp = Some(ts);
        }
        if let Some(control_id) = field_value(msh, 10) {
            enhanced.metadata.message_control_id = Some(control_id);
        }
    }

    if let Some(birth) = document
        .root
        .find_child("PID")
        .and_then(|pid| field_value(pid, 7))
    {
        // Longer than YYYYMMDD means the sender supplied a birth time.
        if birth.len() > 8 && parse_hl7_timestamp(&birth).is_some() {
            debug!("preserving sub-day birth time in extension node");
            if let Some(pid) = enhanced.root.children.iter_mut().find(|c| c.name == "PID") {
                pid.add_child(Node::with_value(
                    "birth-datetime",
                    NodeType::Extension,
                    Value::DateTime(birth),
                ));
            }
        }
    }

    enhanced
}

/// Parse an HL7 TS value (`YYYYMMDD[HHMM[SS[.s]]][+/-ZZZZ]`). Values
/// without an offset are taken as UTC.
pub fn parse_hl7_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let (body, offset) = match text.find(['+', '-']) {
        Some(pos) => (&text[..pos], Some(&text[pos..])),
        None => (text, None),
    };
    // Fractional seconds are not significant for routing
    let body = body.split('.').next()?;

    if !body.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let padded = match body.len() {
        8 => format!("{body}000000"),
        12 => format!("{body}00"),
        14 => body.to_string(),
        _ => return None,
    };

    match offset {
        Some(off) => DateTime::parse_from_str(&format!("{padded}{off}"), "%Y%m%d%H%M%S%z")
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        None => NaiveDateTime::parse_from_str(&padded, "%Y%m%d%H%M%S")
            .ok()
            .map(|dt| dt.and_utc()),
    }
}

/// Parse an HL7 DT value (`YYYYMMDD`), the truncated form of PID-7.
pub fn parse_hl7_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.get(..8)?, "%Y%m%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hl7::Hl7Parser;
    use chrono::Timelike;

    const ORU: &str = "MSH|^~\\&|LAB|ACME|ELR|STATE|20240102030405||ORU^R01|CTRL123|P|2.5.1\r\
PID|1||PATID1234||DOE^JANE||19800101133000|F";

    #[test]
    fn lifts_timestamp_and_control_id() {
        let doc = Hl7Parser::new().parse(ORU).unwrap();
        assert!(doc.metadata.message_timestamp.is_none());

        let enhanced = enhance(&doc);
        assert_eq!(
            enhanced.metadata.message_control_id.as_deref(),
            Some("CTRL123")
        );
        let ts = enhanced.metadata.message_timestamp.unwrap();
        assert_eq!(ts.hour(), 3);
        // Pure: input untouched, identity kept
        assert!(doc.metadata.message_timestamp.is_none());
        assert_eq!(enhanced.metadata.report_id, doc.metadata.report_id);
    }

    #[test]
    fn sub_day_birth_time_gets_an_extension() {
        let doc = Hl7Parser::new().parse(ORU).unwrap();
        let enhanced = enhance(&doc);

        let pid = enhanced.root.find_child("PID").unwrap();
        let ext = pid.find_child("birth-datetime").unwrap();
        assert_eq!(ext.node_type, NodeType::Extension);
        assert_eq!(
            ext.value,
            Some(Value::DateTime("19800101133000".to_string()))
        );
    }

    #[test]
    fn date_only_birth_gets_no_extension() {
        let raw = ORU.replace("19800101133000", "19800101");
        let doc = Hl7Parser::new().parse(&raw).unwrap();
        let enhanced = enhance(&doc);
        assert!(enhanced
            .root
            .find_child("PID")
            .unwrap()
            .find_child("birth-datetime")
            .is_none());
    }

    #[test]
    fn timestamp_parsing_handles_offsets_and_precision() {
        assert!(parse_hl7_timestamp("20240102").is_some());
        assert!(parse_hl7_timestamp("202401020304").is_some());
        let with_offset = parse_hl7_timestamp("20240102030405-0500").unwrap();
        assert_eq!(with_offset.hour(), 8);
        assert!(parse_hl7_timestamp("2024010203040").is_none());
        assert!(parse_hl7_timestamp("not-a-date").is_none());
        assert_eq!(
            parse_hl7_date("19800101"),
            Some(NaiveDate::from_ymd_opt(1980, 1, 1).unwrap())
        );
    }
}
