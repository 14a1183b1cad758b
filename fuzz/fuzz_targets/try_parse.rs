#![no_main]

use libfuzzer_sys::fuzz_target;
use ssa_reassoc::parse::parse_str;
use std::path::Path;

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();

    let s = match std::str::from_utf8(data) {
        Ok(s) => s,
        Err(_) => return,
    };

    log::debug!("input string = \"\"\"\n{}\n\"\"\"", s);

    let graph = match parse_str(s, Some(Path::new("fuzzer.data"))) {
        Ok(graph) => graph,
        Err(_) => return,
    };

    // Non-finite float constants have no literal syntax; everything else
    // prints back to itself.
    let printed = graph.to_string();
    if let Ok(reparsed) = parse_str(&printed, None) {
        assert_eq!(printed, reparsed.to_string());
    }
});
