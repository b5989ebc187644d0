#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use pefsck::fragment::{FragmentStore, TASTE_LEN};

#[derive(Arbitrary, Debug)]
enum Op {
    Pack(Vec<u8>),
    Dedupe(Vec<u8>),
}

fuzz_target!(|ops: Vec<Op>| {
    let mut store = FragmentStore::new(vec![]);
    let mut packed = vec![];
    for op in ops {
        match op {
            Op::Pack(data) => {
                let offset = store.pack(&data).unwrap();
                assert_eq!(packed.len() as u64, offset);
                packed.extend_from_slice(&data);
            }
            Op::Dedupe(tail) => {
                if let Some(m) = store.dedupe(&tail) {
                    let len = m.length as usize;
                    let start = m.offset as usize;
                    assert!(len > TASTE_LEN && len <= tail.len());
                    assert_eq!(&tail[tail.len() - len..], &packed[start..start + len]);
                }
            }
        }
    }
    assert_eq!(packed, store.into_inner());
});
