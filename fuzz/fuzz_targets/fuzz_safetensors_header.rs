//! Fuzz target for SafeTensors JSON header parsing and offset checks.

#![no_main]

use libfuzzer_sys::fuzz_target;
use model_factory::loaders::SafeTensorsHeader;
use model_factory::HeaderLimits;

fuzz_target!(|data: &[u8]| {
    if data.len() < 8 {
        return;
    }
    let (len_bytes, header) = data.split_at(8);
    let mut declared = [0u8; 8];
    declared.copy_from_slice(len_bytes);
    let data_len = u64::from_le_bytes(declared);
    if let Ok(parsed) = SafeTensorsHeader::parse(header, data_len, &HeaderLimits::default()) {
        let _ = parsed.check();
        let _ = parsed.parameter_count();
    }
});
