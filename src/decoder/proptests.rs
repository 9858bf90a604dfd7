//! Property-based tests for the line-protocol decoder
//!
//! Splitting a well-formed body at arbitrary byte offsets (mid-line,
//! mid-character) must not change the decoded delta sequence.

use super::{decode_all, LineDecoder};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Record {
    Content(String),
    Raw(String),
    Blank,
    Malformed,
}

impl Record {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Record::Content(text) => {
                out.extend_from_slice(b"0:");
                out.extend_from_slice(serde_json::to_string(text).unwrap().as_bytes());
            }
            Record::Raw(text) => out.extend_from_slice(text.as_bytes()),
            Record::Blank => {}
            Record::Malformed => out.extend_from_slice(b"0:\"bad \\x escape\""),
        }
        out.push(b'\n');
    }

    fn expected_delta(&self) -> Option<&str> {
        match self {
            Record::Content(text) | Record::Raw(text) => Some(text),
            Record::Blank | Record::Malformed => None,
        }
    }
}

fn arb_record() -> impl Strategy<Value = Record> {
    prop_oneof![
        // Any text, including newlines, quotes and non-ASCII
        5 => any::<String>().prop_map(Record::Content),
        2 => "[a-zA-Z][a-zA-Z0-9 ,.!?éü😀]{0,40}".prop_map(Record::Raw),
        1 => Just(Record::Blank),
        1 => Just(Record::Malformed),
    ]
}

fn arb_body() -> impl Strategy<Value = (Vec<Record>, Vec<u8>)> {
    proptest::collection::vec(arb_record(), 0..20).prop_map(|records| {
        let mut body = Vec::new();
        for record in &records {
            record.encode(&mut body);
        }
        body.extend_from_slice(b"data: [DONE]\n");
        (records, body)
    })
}

fn split_at_offsets(body: &[u8], mut offsets: Vec<usize>) -> Vec<&[u8]> {
    offsets.iter_mut().for_each(|o| *o %= body.len() + 1);
    offsets.sort_unstable();
    offsets.dedup();

    let mut chunks = Vec::new();
    let mut start = 0;
    for offset in offsets {
        chunks.push(&body[start..offset]);
        start = offset;
    }
    chunks.push(&body[start..]);
    chunks
}

proptest! {
    #[test]
    fn chunking_does_not_change_deltas(
        (_, body) in arb_body(),
        offsets in proptest::collection::vec(any::<usize>(), 0..12),
    ) {
        let whole = decode_all(&body);

        let mut decoder = LineDecoder::new();
        let mut chunked = Vec::new();
        for chunk in split_at_offsets(&body, offsets) {
            chunked.extend(decoder.feed(chunk));
        }
        chunked.extend(decoder.finish());

        prop_assert_eq!(chunked, whole);
    }

    #[test]
    fn deltas_match_records_in_order((records, body) in arb_body()) {
        let expected: Vec<&str> = records.iter().filter_map(Record::expected_delta).collect();
        let decoded = decode_all(&body);
        prop_assert_eq!(decoded, expected);
    }

    #[test]
    fn byte_at_a_time_matches_whole((_, body) in arb_body()) {
        let mut decoder = LineDecoder::new();
        let mut deltas = Vec::new();
        for byte in &body {
            deltas.extend(decoder.feed(std::slice::from_ref(byte)));
        }
        deltas.extend(decoder.finish());
        prop_assert_eq!(deltas, decode_all(&body));
    }
}
