//! Packer tests: layout of a packed image, SELF entry, padding, option handling, early failures.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use rkaf::{
    crc32, pack_dir, unwrap_parameter, write_image, ManifestError, PackError, PackOptions,
    PackageImage, RkafHeader, RkafReader, HEADER_LEN, UNRESOLVED_NAND_ADDR,
};

const PARAMETER: &str = "FIRMWARE_VER:4.4.2\n\
MACHINE_MODEL:rk3288\n\
MACHINE_ID:007\n\
MANUFACTURER:RK3288\n\
CMDLINE:console=ttyFIQ0 mtdparts=rk29xxnand:0x00002000@0x00002000(misc),0x00008000@0x00004000(boot),-@0x0000C000(userdata)\n";

const PACKAGE_FILE: &str = "# NAME\tRelative path\n\
package-file\tpackage-file\n\
parameter\tparameter\n\
boot\tImage/boot.img\n\
misc\tImage/misc.img\n\
backup\tSELF\n";

fn boot_image() -> Vec<u8> {
    (0..5000u32).map(|i| (i % 251) as u8 + 1).collect()
}

fn write_fixture(dir: &Path) {
    fs::create_dir_all(dir.join("Image")).unwrap();
    fs::write(dir.join("parameter"), PARAMETER).unwrap();
    fs::write(dir.join("package-file"), PACKAGE_FILE).unwrap();
    fs::write(dir.join("Image/boot.img"), boot_image()).unwrap();
    fs::write(dir.join("Image/misc.img"), vec![0xAB; 2048]).unwrap();
}

fn pack_in_memory(dir: &Path) -> (RkafHeader, Vec<u8>) {
    let image = PackageImage::load(dir).unwrap();
    let mut buf = Cursor::new(Vec::new());
    let header = write_image(&mut buf, &image, dir, &PackOptions::default()).unwrap();
    (header, buf.into_inner())
}

/// Pack the fixture in memory and check every part's placement.
#[test]
fn packer_layout() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let (header, bytes) = pack_in_memory(dir.path());

    assert_eq!(header.length, 14336);
    assert_eq!(bytes.len(), 14336 + 4);
    assert_eq!(header.model, "rk3288");
    assert_eq!(header.id, "007");
    assert_eq!(header.manufacturer, "RK3288");
    assert_eq!(header.version, 0x0404_0002);

    let decoded = RkafHeader::decode(&bytes).unwrap();
    assert_eq!(decoded, header);

    let pkg = &header.parts[0];
    assert_eq!((pkg.pos, pkg.size, pkg.padded_size), (2048, PACKAGE_FILE.len() as u32, 2048));
    assert_eq!(pkg.nand_addr, UNRESOLVED_NAND_ADDR);

    let param = &header.parts[1];
    assert_eq!(param.pos, 4096);
    assert_eq!(param.size, PARAMETER.len() as u32 + 12);
    assert_eq!(param.padded_size, 2048);
    assert_eq!((param.nand_addr, param.nand_size), (0, 0x2000));

    let boot = &header.parts[2];
    assert_eq!((boot.pos, boot.size, boot.padded_size), (6144, 5000, 6144));
    assert_eq!((boot.nand_addr, boot.nand_size), (0x4000, 0x8000));

    let misc = &header.parts[3];
    assert_eq!((misc.pos, misc.size, misc.padded_size), (12288, 2048, 2048));
    assert_eq!((misc.nand_addr, misc.nand_size), (0x2000, 0x2000));
}

/// SELF gets the image length plus the trailer, padded to 512, and no data.
#[test]
fn packer_self_entry() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let (header, _) = pack_in_memory(dir.path());

    let backup = &header.parts[4];
    assert_eq!(backup.filename, "SELF");
    assert_eq!(backup.pos, 0);
    assert_eq!(backup.size, header.length + 4);
    assert_eq!(backup.padded_size, 14848);
}

#[test]
fn packer_trailer_is_crc_of_body() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let (header, bytes) = pack_in_memory(dir.path());

    let length = header.length as usize;
    let trailer = u32::from_le_bytes(bytes[length..length + 4].try_into().unwrap());
    assert_eq!(trailer, crc32(0, &bytes[..length]));
}

/// Ordinary parts are zero-padded to the chunk size; the parameter part is a PARM block.
#[test]
fn packer_padding_and_parameter_block() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let (header, bytes) = pack_in_memory(dir.path());

    let boot = &header.parts[2];
    let start = boot.pos as usize;
    assert_eq!(&bytes[start..start + 5000], boot_image().as_slice());
    assert!(bytes[start + 5000..start + boot.padded_size as usize]
        .iter()
        .all(|&b| b == 0));

    let param = &header.parts[1];
    let block = &bytes[param.pos as usize..(param.pos + param.padded_size) as usize];
    assert_eq!(&block[..4], b"PARM");
    assert_eq!(unwrap_parameter(block).unwrap(), PARAMETER.as_bytes());
    assert!(block[param.size as usize..].iter().all(|&b| b == 0));

    assert!(bytes[HEADER_LEN - 0x74..HEADER_LEN].iter().all(|&b| b == 0));
}

#[test]
fn packer_custom_chunk_size() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let image = PackageImage::load(dir.path()).unwrap();
    let options = PackOptions {
        chunk_size: 512,
        parameter_block_size: 1024,
        self_alignment: 4096,
    };
    let mut buf = Cursor::new(Vec::new());
    let header = write_image(&mut buf, &image, dir.path(), &options).unwrap();

    assert_eq!(header.parts[0].padded_size, 512);
    assert_eq!(header.parts[1].padded_size, 1024);
    assert_eq!(header.parts[2].padded_size, 5120);
    assert_eq!(header.parts[4].padded_size % 4096, 0);
    assert_eq!(header.length, 2048 + 512 + 1024 + 5120 + 2048);
}

/// A parameter file bigger than the block keeps only what fits.
#[test]
fn packer_truncates_oversized_parameter() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let image = PackageImage::load(dir.path()).unwrap();
    let options = PackOptions {
        parameter_block_size: 64,
        ..PackOptions::default()
    };
    let mut buf = Cursor::new(Vec::new());
    let header = write_image(&mut buf, &image, dir.path(), &options).unwrap();
    let bytes = buf.into_inner();

    let param = &header.parts[1];
    assert_eq!(param.size, 64);
    assert_eq!(param.padded_size, 64);
    let block = &bytes[param.pos as usize..(param.pos + 64) as usize];
    assert_eq!(unwrap_parameter(block).unwrap(), &PARAMETER.as_bytes()[..52]);
}

/// An over-long MACHINE_MODEL fails the pack before the destination is created.
#[test]
fn packer_rejects_oversized_field_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let bad = PARAMETER.replace("MACHINE_MODEL:rk3288", &format!("MACHINE_MODEL:{}", "m".repeat(34)));
    fs::write(dir.path().join("parameter"), bad).unwrap();

    let out = tempfile::tempdir().unwrap();
    let dst = out.path().join("update.img");
    let err = pack_dir(dir.path(), &dst, &PackOptions::default()).unwrap_err();
    assert!(matches!(err, PackError::Manifest(ManifestError::InFile { .. })), "{err}");
    assert!(!dst.exists());
}

#[test]
fn packer_missing_part_file_names_path() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    fs::remove_file(dir.path().join("Image/misc.img")).unwrap();

    let out = tempfile::tempdir().unwrap();
    let err = pack_dir(dir.path(), out.path().join("update.img"), &PackOptions::default())
        .unwrap_err();
    match err {
        PackError::Io { path, .. } => assert!(path.ends_with("Image/misc.img")),
        other => panic!("expected Io error, got {other:?}"),
    }
}

#[test]
fn packer_rejects_invalid_options() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let out = tempfile::tempdir().unwrap();
    let dst = out.path().join("update.img");

    for options in [
        PackOptions {
            chunk_size: 0,
            ..PackOptions::default()
        },
        PackOptions {
            parameter_block_size: 12,
            ..PackOptions::default()
        },
        PackOptions {
            self_alignment: 0,
            ..PackOptions::default()
        },
    ] {
        let err = pack_dir(dir.path(), &dst, &options).unwrap_err();
        assert!(matches!(err, PackError::InvalidOptions(_)), "{err}");
    }
    assert!(!dst.exists());
}

#[test]
fn pack_options_from_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pack.toml");
    fs::write(&path, "chunk_size = 4096\n").unwrap();
    let options = PackOptions::from_toml_file(&path).unwrap();
    assert_eq!(
        options,
        PackOptions {
            chunk_size: 4096,
            ..PackOptions::default()
        }
    );

    fs::write(&path, "chunk_sise = 4096\n").unwrap();
    assert!(matches!(
        PackOptions::from_toml_file(&path),
        Err(PackError::Config { .. })
    ));

    fs::write(&path, "parameter_block_size = 8\n").unwrap();
    assert!(matches!(
        PackOptions::from_toml_file(&path),
        Err(PackError::InvalidOptions(_))
    ));
}

/// The trailer goes right after `length`, even when the writer already holds more bytes.
#[test]
fn packer_trailer_position_in_prefilled_writer() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path());
    let image = PackageImage::load(dir.path()).unwrap();
    let mut buf = Cursor::new(vec![0xEE; 100_000]);
    let header = write_image(&mut buf, &image, dir.path(), &PackOptions::default()).unwrap();
    let mut bytes = buf.into_inner();

    let length = header.length as usize;
    let trailer = u32::from_le_bytes(bytes[length..length + 4].try_into().unwrap());
    assert_eq!(trailer, crc32(0, &bytes[..length]));
    assert!(bytes[length + 4..].iter().all(|&b| b == 0xEE));

    bytes.truncate(length + 4);
    let out = tempfile::tempdir().unwrap();
    let path = out.path().join("update.img");
    fs::write(&path, &bytes).unwrap();
    RkafReader::open(&path).unwrap().verify_checksum().unwrap();
}
