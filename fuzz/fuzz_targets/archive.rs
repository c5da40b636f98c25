#![no_main]

use arbitrary::Arbitrary;
use std::collections::HashMap;
use libfuzzer_sys::fuzz_target;
use flatfs::archive::{Archive, ArchiveOptions, FsError, LayoutKind};

#[derive(Arbitrary, Clone, Debug)]
enum Op {
    Put { name: u8, data: Vec<u8> },
    Append { name: u8, data: Vec<u8> },
    WriteAt { name: u8, offset: u16, data: Vec<u8> },
    Truncate { name: u8, len: u16 },
    Remove { name: u8 },
    Reopen,
}

/// Returns the path for a name index.
///
/// Even indexes live in the root, odd ones in `dir`. With 128 eight digit
/// names each, a directory can’t hold all of them, so operations also run
/// into full directories.
fn name(index: u8) -> String {
    if index & 1 == 0 {
        format!("{:08}", index >> 1)
    }
    else {
        format!("dir/{:08}", index >> 1)
    }
}

fn all_names() -> impl Iterator<Item = String> {
    (0..=u8::MAX).map(name)
}

/// Returns whether the error is the archive running out of capacity.
fn is_capacity<T>(res: &Result<T, FsError>) -> bool {
    matches!(res, Err(FsError::Archive(err)) if err.is_capacity())
}

fn check_archive(
    archive: &mut Archive,
    content: &HashMap<String, Vec<u8>>,
) {
    archive.verify().unwrap();
    for name in all_names() {
        match content.get(&name) {
            Some(data) => {
                assert_eq!(
                    archive.get(&name).unwrap().as_ref(), data.as_slice()
                )
            }
            None => {
                assert!(matches!(archive.get(&name), Err(FsError::NotFound)))
            }
        }
    }
}

fn run_archive(typed: bool, ops: impl IntoIterator<Item = Op>) {
    let options = ArchiveOptions {
        block_size: 64,
        max_file_size: 1000,
        cache_blocks: 4,
        layout: if typed { LayoutKind::Typed } else { LayoutKind::Shared },
    };
    let file = tempfile::tempfile().unwrap();
    let mut archive = Archive::create_with_file(
        file.try_clone().unwrap(), &options
    ).unwrap();
    archive.mkdir("dir").unwrap();
    let limit = archive.max_file_size();
    let mut content: HashMap<String, Vec<u8>> = HashMap::new();

    for item in ops {
        match item {
            Op::Put { name: index, data } => {
                let name = name(index);
                let res = archive.put(&name, &data);
                if data.len() as u64 > limit {
                    assert!(is_capacity(&res));
                }
                else if !content.contains_key(&name) && is_capacity(&res) {
                    // The directory is full.
                }
                else {
                    res.unwrap();
                    content.insert(name, data);
                }
            }
            Op::Append { name: index, data } => {
                let name = name(index);
                let old = content.get(&name).map(Vec::len);
                let res = archive.append(&name, &data);
                if (old.unwrap_or(0) + data.len()) as u64 > limit {
                    assert!(is_capacity(&res));
                }
                else if old.is_none() && is_capacity(&res) {
                    // The directory is full.
                }
                else {
                    res.unwrap();
                    content.entry(name).or_default().extend(data);
                }
            }
            Op::WriteAt { name: index, offset, data } => {
                let name = name(index);
                let res = archive.write_at(&name, offset.into(), &data);
                let end = usize::from(offset) + data.len();
                match content.get_mut(&name) {
                    None => {
                        assert!(matches!(res, Err(FsError::NotFound)))
                    }
                    Some(_) if end as u64 > limit => {
                        assert!(is_capacity(&res))
                    }
                    Some(old) => {
                        res.unwrap();
                        if !data.is_empty() {
                            if old.len() < end {
                                old.resize(end, 0);
                            }
                            old[usize::from(offset)..end]
                                .copy_from_slice(&data);
                        }
                    }
                }
            }
            Op::Truncate { name: index, len } => {
                let name = name(index);
                let res = archive.truncate(&name, len.into());
                match content.get_mut(&name) {
                    None => {
                        assert!(matches!(res, Err(FsError::NotFound)))
                    }
                    Some(_) if u64::from(len) > limit => {
                        assert!(is_capacity(&res))
                    }
                    Some(old) => {
                        res.unwrap();
                        old.resize(len.into(), 0);
                    }
                }
            }
            Op::Remove { name: index } => {
                let name = name(index);
                let res = archive.remove(&name);
                if content.remove(&name).is_some() {
                    res.unwrap();
                }
                else {
                    assert!(matches!(res, Err(FsError::NotFound)))
                }
            }
            Op::Reopen => {
                archive.close().unwrap();
                archive = Archive::open_with_file(
                    file.try_clone().unwrap(), Some(&options)
                ).unwrap();
            }
        }

        check_archive(&mut archive, &content);
    }
}

fuzz_target!{|data: (bool, Vec<Op>)| {
    run_archive(data.0, data.1)
}}
