#![no_main]

use std::io::Write;

use libfuzzer_sys::fuzz_target;
use rkaf::{unwrap_parameter, ParameterFile, RkafHeader, RkafReader};

fuzz_target!(|data: &[u8]| {
    let _ = RkafHeader::decode(data);
    let _ = unwrap_parameter(data);
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = ParameterFile::parse(text);
    }

    let mut file = match tempfile::NamedTempFile::new() {
        Ok(f) => f,
        Err(_) => return,
    };
    if file.write_all(data).is_err() {
        return;
    }
    let mut reader = match RkafReader::open(file.path()) {
        Ok(r) => r,
        Err(_) => return,
    };
    let _ = reader.verify_checksum();
    let names: Vec<String> = reader.parts().iter().map(|p| p.name.clone()).collect();
    for name in names {
        let _ = reader.read_part(&name);
    }
});
