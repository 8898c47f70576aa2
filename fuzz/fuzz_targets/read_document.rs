#![no_main]
use std::sync::Arc;

use gbx_pack::{Document, ReadSettings, Registry, WriteSettings, ZstdCompressor};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let registry = Arc::new(Registry::default());
    let compressor = Arc::new(ZstdCompressor::default());
    let settings = ReadSettings::new().compressor(compressor.clone());
    if let Ok(doc) = Document::read(data, registry, &settings) {
        // Anything that reads must write back out.
        let _ = doc.write(&WriteSettings::new().compressor(compressor));
    }
});
