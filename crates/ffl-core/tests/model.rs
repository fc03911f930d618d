//! A volume behaves like a map of byte vectors under any operation mix.

use ffl_core::{Volume, VolumeConfig};
use ffl_device::{FlashDevice, MemFlash};
use ffl_error::FflError;
use ffl_types::{FlashGeometry, InodeNumber};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Write { ino: u32, offset: u32, len: u32, seed: u8 },
    Truncate { ino: u32, size: u32 },
    Delete { ino: u32 },
    Sync,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        8 => (1_u32..3, 0_u32..6000, 1_u32..2000, any::<u8>())
            .prop_map(|(ino, offset, len, seed)| Op::Write { ino, offset, len, seed }),
        2 => (1_u32..3, 0_u32..8000).prop_map(|(ino, size)| Op::Truncate { ino, size }),
        1 => (1_u32..3).prop_map(|ino| Op::Delete { ino }),
        1 => Just(Op::Sync),
    ]
}

fn volume() -> Volume {
    let geometry = FlashGeometry::new(16 * 4096, 4096, 512).expect("geometry");
    let flash: Arc<dyn FlashDevice> = Arc::new(MemFlash::new(geometry));
    Volume::format(flash, VolumeConfig::default()).expect("format")
}

fn fail(err: FflError) -> TestCaseError {
    TestCaseError::fail(err.to_string())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn contents_match_a_plain_model(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let vol = volume();
        let mut model: BTreeMap<u32, Vec<u8>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Write { ino, offset, len, seed } => {
                    let data: Vec<u8> = (0..len).map(|i| seed ^ (i as u8)).collect();
                    vol.write_data(InodeNumber(ino), offset, &data).map_err(fail)?;
                    let file = model.entry(ino).or_default();
                    let end = (offset + len) as usize;
                    if file.len() < end {
                        file.resize(end, 0);
                    }
                    file[offset as usize..end].copy_from_slice(&data);
                }
                Op::Truncate { ino, size } => match model.get_mut(&ino) {
                    Some(file) => {
                        vol.truncate(InodeNumber(ino), size).map_err(fail)?;
                        file.resize(size as usize, 0);
                    }
                    None => {
                        let err = vol.truncate(InodeNumber(ino), size);
                        prop_assert!(matches!(err, Err(FflError::NotFound(_))));
                    }
                },
                Op::Delete { ino } => {
                    if model.remove(&ino).is_some() {
                        vol.delete_inode(InodeNumber(ino)).map_err(fail)?;
                    }
                }
                Op::Sync => vol.sync().map_err(fail)?,
            }
            vol.check_accounting().map_err(fail)?;
        }

        for (ino, expected) in &model {
            prop_assert_eq!(vol.file_size(InodeNumber(*ino)), Some(expected.len() as u32));
            let got = vol
                .read_data(InodeNumber(*ino), 0, expected.len() as u32)
                .map_err(fail)?;
            prop_assert_eq!(&got, expected);
        }
        let mut inodes: Vec<u32> = vol.inodes().into_iter().map(|ino| ino.0).collect();
        inodes.sort_unstable();
        prop_assert_eq!(inodes, model.keys().copied().collect::<Vec<_>>());
    }
}
