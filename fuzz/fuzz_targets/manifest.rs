#![no_main]

use libfuzzer_sys::fuzz_target;
use pesmith::manifest::NativeManifest;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(manifest) = NativeManifest::parse(text) {
        let _ = manifest.requested_execution_level();
        let _ = manifest.dependencies();
        let _ = manifest.to_xml();
    }
});
