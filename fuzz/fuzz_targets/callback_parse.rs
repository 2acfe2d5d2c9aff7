#![no_main]

//! Fuzz target for callback envelope and message parsing.
//!
//! Covers the XML and JSON readers with arbitrary bytes, including invalid
//! UTF-8, nested elements, and unterminated CDATA.

use courier_api::processor::envelope_fields;
use courier_core::{message::xml_fields, ParsedMessage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = envelope_fields(data);

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = xml_fields(text);
        if let Ok(message) = ParsedMessage::parse(text) {
            let _ = message.event();
            let _ = message.text();
        }
    }
});
