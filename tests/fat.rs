//! Filesystem contract scenarios over a RAM-backed volume.

use mimic::fs::{format, OpenMode, RamDisk, Volume};

fn fresh(sectors: u32) -> Volume<RamDisk> {
    let mut disk = RamDisk::new(sectors);
    format(&mut disk, "MIMIC").unwrap();
    Volume::mount(disk).unwrap()
}

#[test]
fn hello_round_trip_allocates_one_cluster() {
    let mut vol = fresh(4096);

    let mut handle = vol
        .open("hello.txt", OpenMode::WRITE | OpenMode::CREATE)
        .unwrap();
    vol.write(&mut handle, b"hello\n").unwrap();
    vol.close(handle).unwrap();

    let listing = vol.read_dir("/").unwrap();
    let entry = listing.iter().find(|e| e.name == "HELLO.TXT").unwrap();
    assert_eq!(entry.size, 6);
    assert_ne!(entry.first_cluster, 0);
    assert_eq!(vol.chain_length(entry.first_cluster).unwrap(), 1);

    let mut handle = vol.open("hello.txt", OpenMode::READ).unwrap();
    let mut out = [0u8; 6];
    assert_eq!(vol.read(&mut handle, &mut out).unwrap(), 6);
    assert_eq!(&out, b"hello\n");
    vol.close(handle).unwrap();
}

#[test]
fn cluster_count_matches_file_size() {
    let mut vol = fresh(4096);
    let bpc = vol.bytes_per_cluster();

    for (name, len) in [("a.bin", bpc - 1), ("b.bin", bpc), ("c.bin", bpc * 2 + 1)] {
        vol.write_file(name, &vec![0x5A; len as usize]).unwrap();
        let listing = vol.read_dir("/").unwrap();
        let entry = listing
            .iter()
            .find(|e| e.name == name.to_uppercase())
            .unwrap();
        let expected = (len + bpc - 1) / bpc;
        assert_eq!(
            vol.chain_length(entry.first_cluster).unwrap(),
            expected,
            "{} bytes",
            len
        );
    }
}

#[test]
fn contents_survive_remount() {
    let mut vol = fresh(4096);
    vol.write_file("keep.txt", b"persistent").unwrap();
    let disk = vol.unmount().unwrap();

    let mut vol = Volume::mount(disk).unwrap();
    assert_eq!(vol.read_file("keep.txt").unwrap(), b"persistent");
}

#[test]
fn sector_straddling_write_reads_back_intact() {
    // 1000 bytes ends mid-sector, so the tail goes through the
    // read-modify-write path.
    let mut vol = fresh(4096);
    let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    vol.write_file("base.bin", &data).unwrap();

    let mut handle = vol.open("base.bin", OpenMode::READ).unwrap();
    let mut out = vec![0; 1000];
    assert_eq!(vol.read(&mut handle, &mut out).unwrap(), 1000);
    vol.close(handle).unwrap();
    assert_eq!(out, data);
}

#[test]
fn files_in_subdirectory_fail_without_the_directory() {
    let mut vol = fresh(4096);
    assert!(vol
        .open("no_dir/file.txt", OpenMode::WRITE | OpenMode::CREATE)
        .is_err());
}

#[test]
fn many_files_in_root() {
    let mut vol = fresh(4096);
    for index in 0..12 {
        let name = format!("f{}.bin", index);
        vol.write_file(&name, &[index as u8; 100]).unwrap();
    }
    let listing = vol.read_dir("/").unwrap();
    assert_eq!(listing.len(), 12);
    for index in 0..12 {
        let name = format!("f{}.bin", index);
        assert_eq!(vol.read_file(&name).unwrap(), vec![index as u8; 100]);
    }
}
