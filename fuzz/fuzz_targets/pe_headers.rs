#![no_main]

use libfuzzer_sys::fuzz_target;
use pesmith::{
    managed::ManagedAssembly,
    pe::{imported_dlls, PeHeaders, PeInfo},
    resources::ResourceTable,
};

fuzz_target!(|data: &[u8]| {
    let Ok(probe) = PeHeaders::parse(data) else {
        return;
    };
    let _ = PeInfo::from_probe(&probe).executable_info();
    if let Some(headers) = probe.headers() {
        let _ = imported_dlls(data, headers);
        let _ = ManagedAssembly::read(data, headers);
        if let Ok(table) = ResourceTable::read(data, headers) {
            let _ = table.version();
            let _ = table.manifest_text();
        }
    }
});
