#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

use pefsck::erofs::Erofs;
use pefsck::fsck::{Fsck, FsckConfig};

#[derive(Arbitrary, Debug)]
struct Input {
    extract: bool,
    threaded: bool,
    image: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let Ok(fs) = Erofs::open(Box::new(input.image)) else {
        return;
    };
    let dir = tempdir().unwrap();
    let cfg = FsckConfig {
        extract_path: input.extract.then(|| dir.path().join("out")),
        check_decomp: true,
        print_comp_ratio: true,
        workers: if input.threaded { 2 } else { 0 },
        ..Default::default()
    };
    let report = Fsck::new(Arc::new(fs), cfg).run();
    if let Some(ratio) = report.compression_ratio {
        assert!(ratio >= 0.0);
    }
});
