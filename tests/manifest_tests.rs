//! Manifest tests: parameter file keys and limits, package list parsing and flash resolution.

use std::fs;

use rkaf::manifest::parse_package_list;
use rkaf::{
    FirmwareVersion, FormatError, ManifestError, PackageImage, ParameterFile, PartitionTable,
    UNRESOLVED_NAND_ADDR,
};

const PARAMETER: &str = "\
FIRMWARE_VER:4.4.2
MACHINE_MODEL:rk3288
MACHINE_ID:007
MANUFACTURER:RK3288
MAGIC: 0x5041524B

# flash layout
CMDLINE:console=ttyFIQ0 androidboot.console=ttyFIQ0 mtdparts=rk29xxnand:0x00002000@0x00002000(misc),0x00008000@0x0000A000(boot),-@0x00012000(userdata)
";

#[test]
fn parameter_parses_known_keys() {
    let param = ParameterFile::parse(PARAMETER).unwrap();
    assert_eq!(
        param.version,
        FirmwareVersion {
            major: 4,
            minor: 4,
            patch: 2
        }
    );
    assert_eq!(param.version.packed(), 0x0404_0002);
    assert_eq!(param.model, "rk3288");
    assert_eq!(param.id, "007");
    assert_eq!(param.manufacturer, "RK3288");
    assert_eq!(param.partitions.len(), 3);
    assert_eq!(param.partitions.find("boot").unwrap().start, 0xA000);
}

#[test]
fn parameter_accepts_crlf_and_trims() {
    let text = "  MACHINE_MODEL:box  \r\n\r\n#x\r\nMACHINE_ID:1";
    let param = ParameterFile::parse(text).unwrap();
    assert_eq!(param.model, "box");
    assert_eq!(param.id, "1");
}

/// A value must leave room for the NUL terminator: width - 1 fits, width does not.
#[test]
fn parameter_field_width_is_hard_limit() {
    let ok = format!("MACHINE_MODEL:{}\n", "m".repeat(33));
    assert_eq!(ParameterFile::parse(&ok).unwrap().model.len(), 33);

    let too_long = format!("FIRMWARE_VER:1.0.0\nMACHINE_MODEL:{}\n", "m".repeat(34));
    match ParameterFile::parse(&too_long) {
        Err(ManifestError::Field {
            line: 2,
            source: FormatError::FieldTooLong { len: 34, max: 33, .. },
        }) => {}
        other => panic!("expected FieldTooLong on line 2, got {other:?}"),
    }

    let id = format!("MACHINE_ID:{}\n", "i".repeat(30));
    assert!(ParameterFile::parse(&id).is_err());
    let manufacturer = format!("MANUFACTURER:{}\n", "x".repeat(56));
    assert!(ParameterFile::parse(&manufacturer).is_err());
}

#[test]
fn parameter_line_without_colon_rejected() {
    let err = ParameterFile::parse("FIRMWARE_VER:1.0.0\nGARBAGE\n").unwrap_err();
    assert!(matches!(err, ManifestError::MissingDelimiter { line: 2, .. }));
}

#[test]
fn parameter_bad_version_rejected() {
    let err = ParameterFile::parse("FIRMWARE_VER:1.x.3\n").unwrap_err();
    assert!(matches!(err, ManifestError::InvalidVersion { line: 1, .. }));
    assert!(ParameterFile::parse("FIRMWARE_VER:1.2\n").is_err());
    assert!(ParameterFile::parse("FIRMWARE_VER:256.0.0\n").is_err());
}

#[test]
fn parameter_partition_overflow_rejected() {
    let tokens: Vec<String> = (0..17).map(|i| format!("0x1@{i:#x}(p{i})")).collect();
    let text = format!("CMDLINE:mtdparts=nand:{}\n", tokens.join(","));
    let err = ParameterFile::parse(&text).unwrap_err();
    assert!(matches!(err, ManifestError::Partition { line: 1, .. }));
}

#[test]
fn package_list_resolves_flash_targets() {
    let partitions = ParameterFile::parse(PARAMETER).unwrap().partitions;
    let text = "\u{feff}# NAME\tRelative path\n\
                package-file\tpackage-file\n\
                parameter\tparameter\n\
                boot   Image/boot.img\n\
                misc\tImage/misc image.img\n\
                backup\tSELF\n";
    let entries = parse_package_list(text, &partitions).unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["package-file", "parameter", "boot", "misc", "backup"]);

    assert_eq!(entries[0].nand_addr, UNRESOLVED_NAND_ADDR);
    assert_eq!(entries[0].nand_size, 0);
    assert_eq!((entries[1].nand_addr, entries[1].nand_size), (0, 0x2000));
    assert_eq!(entries[2].filename, "Image/boot.img");
    assert_eq!((entries[2].nand_addr, entries[2].nand_size), (0xA000, 0x8000));
    assert_eq!(entries[3].filename, "Image/misc image.img");
    assert_eq!(entries[4].filename, "SELF");
    assert_eq!(entries[4].nand_addr, UNRESOLVED_NAND_ADDR);
}

#[test]
fn package_list_bom_on_first_entry() {
    let entries = parse_package_list("\u{feff}boot boot.img\n", &PartitionTable::new()).unwrap();
    assert_eq!(entries[0].name, "boot");
}

#[test]
fn package_list_missing_path_rejected() {
    let err = parse_package_list("boot boot.img\nlonely\n", &PartitionTable::new()).unwrap_err();
    assert!(matches!(err, ManifestError::MissingDelimiter { line: 2, .. }));
}

#[test]
fn package_list_limits() {
    let long_name = format!("{} x.img\n", "n".repeat(32));
    assert!(matches!(
        parse_package_list(&long_name, &PartitionTable::new()),
        Err(ManifestError::Field { line: 1, .. })
    ));

    let text: String = (0..17).map(|i| format!("p{i} p{i}.img\n")).collect();
    assert!(matches!(
        parse_package_list(&text, &PartitionTable::new()),
        Err(ManifestError::TooManyPackages)
    ));
}

#[test]
fn package_image_load_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("parameter"), PARAMETER).unwrap();

    let err = PackageImage::load(dir.path()).unwrap_err();
    match err {
        ManifestError::Io { path, .. } => assert!(path.ends_with("package-file")),
        other => panic!("expected Io error, got {other:?}"),
    }

    fs::write(dir.path().join("package-file"), "boot boot.img\n").unwrap();
    let image = PackageImage::load(dir.path()).unwrap();
    assert_eq!(image.packages.len(), 1);
    assert_eq!(image.packages[0].nand_addr, 0xA000);
}

/// Parse errors are attributed to the file they came from.
#[test]
fn package_image_load_names_failing_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("parameter"), "MACHINE_ID:ok\nbroken\n").unwrap();
    fs::write(dir.path().join("package-file"), "boot boot.img\n").unwrap();

    let err = PackageImage::load(dir.path()).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("parameter"), "{msg}");
    assert!(msg.contains("line 2"), "{msg}");
}

#[test]
fn parameter_version_ignores_trailing_text() {
    let param = ParameterFile::parse("FIRMWARE_VER:5.0.1 build 123\n").unwrap();
    assert_eq!(param.version.packed(), 0x0500_0001);
}

/// Paths must leave room for the NUL in the 60-byte filename field.
#[test]
fn package_list_path_width_is_hard_limit() {
    let ok = format!("boot {}\n", "p".repeat(59));
    assert_eq!(
        parse_package_list(&ok, &PartitionTable::new()).unwrap()[0].filename.len(),
        59
    );

    let too_long = format!("boot {}\n", "p".repeat(60));
    match parse_package_list(&too_long, &PartitionTable::new()) {
        Err(ManifestError::Field {
            line: 1,
            source: FormatError::FieldTooLong { len: 60, max: 59, .. },
        }) => {}
        other => panic!("expected FieldTooLong, got {other:?}"),
    }
}

#[test]
fn manifest_must_be_utf8() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("parameter"), b"MACHINE_MODEL:\xff\xfe\n").unwrap();
    fs::write(dir.path().join("package-file"), "boot boot.img\n").unwrap();

    match PackageImage::load(dir.path()) {
        Err(ManifestError::InFile { path, source }) => {
            assert!(path.ends_with("parameter"));
            assert!(matches!(*source, ManifestError::InvalidUtf8));
        }
        other => panic!("expected InvalidUtf8, got {other:?}"),
    }

    fs::write(dir.path().join("parameter"), PARAMETER).unwrap();
    fs::write(dir.path().join("package-file"), b"boot \xc0.img\n").unwrap();
    match PackageImage::load(dir.path()) {
        Err(ManifestError::InFile { path, source }) => {
            assert!(path.ends_with("package-file"));
            assert!(matches!(*source, ManifestError::InvalidUtf8));
        }
        other => panic!("expected InvalidUtf8, got {other:?}"),
    }
}
