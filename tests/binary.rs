//! Loading, inspecting, editing and saving binaries through a registry.

mod common;

use std::{fs, sync::Arc, thread, time::Duration};

use common::{RecordingSigner, Workspace};
use md5::{Digest, Md5};
use pesmith::{
    manifest::ExecutionLevel,
    pe::{Cor20Header, ImageBuilder},
    BinaryLoadOptions, Error, ExecutableInfo, FourPartVersion, VersionField,
};

const COMPANY_ATTRIBUTE: &str = "System.Reflection.AssemblyCompanyAttribute";
const FILE_VERSION_ATTRIBUTE: &str = "System.Reflection.AssemblyFileVersionAttribute";

fn native_tool() -> Vec<u8> {
    ImageBuilder::new()
        .subsystem(3)
        .import("KERNEL32.dll")
        .import("ADVAPI32.dll")
        .version_field(VersionField::CompanyName, "Contoso")
        .version_field(VersionField::ProductName, "Tools")
        .version_field(VersionField::FileVersion, "1.0.0.0")
        .build()
        .unwrap()
}

#[test]
fn native_image_properties() {
    let workspace = Workspace::new();
    let path = workspace.file("tool.exe", &native_tool());
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();

    assert!(binary.is_pe_file().unwrap());
    assert!(binary.is_32bit_pe().unwrap());
    assert!(!binary.is_64bit_pe().unwrap());
    assert!(binary.is_native().unwrap());
    assert!(!binary.is_managed().unwrap());
    assert!(binary.is_console_app().unwrap());
    assert_eq!(
        binary.executable_info().unwrap(),
        ExecutableInfo::NATIVE | ExecutableInfo::X86
    );
    assert_eq!(
        binary.native_dependencies().unwrap(),
        vec!["KERNEL32.dll".to_string(), "ADVAPI32.dll".to_string()]
    );
    assert_eq!(binary.company_name().unwrap().as_deref(), Some("Contoso"));
    assert_eq!(binary.file_version().unwrap(), FourPartVersion::new(1, 0, 0, 0));
    assert!(binary.managed_assembly().unwrap().is_none());
    assert!(!binary.is_strong_named().unwrap());

    let expected = format!("{:x}", Md5::digest(fs::read(&path).unwrap()));
    assert_eq!(binary.md5().unwrap(), expected);
}

#[test]
fn files_that_are_not_pe_images_load() {
    let workspace = Workspace::new();
    let path = workspace.file("readme.txt", b"just text");
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();

    assert!(!binary.is_pe_file().unwrap());
    assert!(!binary.is_managed().unwrap());
    assert!(!binary.is_native().unwrap());
    assert_eq!(binary.executable_info().unwrap(), ExecutableInfo::empty());
    assert!(binary.manifest().unwrap().is_none());
    assert!(binary.native_resources().unwrap().is_none());
    assert!(binary.native_dependencies().unwrap().is_empty());

    binary.mark_modified();
    binary.save().unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"just text");
    assert!(!binary.is_modified().unwrap());
}

#[test]
fn missing_file_is_an_error() {
    let workspace = Workspace::new();
    let err = workspace
        .registry
        .load(workspace.dir.path().join("absent.dll"), BinaryLoadOptions::ALL)
        .unwrap_err();
    assert!(matches!(err.root(), Error::FileError(_)));
    assert!(workspace.registry.files().is_empty());
}

#[test]
fn concurrent_loads_share_one_instance() {
    let workspace = Arc::new(Workspace::new());
    let path = workspace.file("tool.exe", &native_tool());

    let loaded: Vec<_> = (0..8)
        .map(|_| {
            let workspace = Arc::clone(&workspace);
            let path = path.clone();
            thread::spawn(move || workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert!(loaded.iter().all(|binary| Arc::ptr_eq(binary, &loaded[0])));
    assert_eq!(workspace.working_copies().len(), 1);
    assert_eq!(workspace.registry.files().len(), 1);
    assert!(!workspace.registry.is_anything_still_loading());
}

#[test]
fn spawned_load_resolves_to_the_registered_binary() {
    let workspace = Workspace::new();
    let path = workspace.file("tool.exe", &native_tool());

    let handle = workspace.registry.spawn_load(path.clone(), BinaryLoadOptions::DELAY_LOAD);
    let binary = handle.wait().unwrap();
    assert!(handle.is_finished());
    assert!(Arc::ptr_eq(&binary, &workspace.registry.get(&path).unwrap()));
}

#[test]
fn concurrent_reads_agree() {
    let workspace = Workspace::new();
    let path = workspace.file("tool.exe", &native_tool());
    let binary = workspace
        .registry
        .load(&path, BinaryLoadOptions::DELAY_LOAD)
        .unwrap();

    let values: Vec<_> = (0..16)
        .map(|_| {
            let binary = Arc::clone(&binary);
            thread::spawn(move || binary.company_name().unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert!(values.iter().all(|value| value.as_deref() == Some("Contoso")));
}

#[test]
fn attribute_values_win_over_resource_values() {
    let workspace = Workspace::new();
    let image = ImageBuilder::new()
        .managed("Contoso.Core", "2.0.0.0")
        .assembly_attribute(COMPANY_ATTRIBUTE, "Contoso Ltd")
        .assembly_attribute(FILE_VERSION_ATTRIBUTE, "2.1.0.0")
        .version_field(VersionField::CompanyName, "Old Company")
        .version_field(VersionField::LegalTrademarks, "TM")
        .build()
        .unwrap();
    let path = workspace.file("Contoso.Core.dll", &image);
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();

    assert!(binary.is_managed().unwrap());
    assert!(binary.is_any_cpu().unwrap());
    assert!(binary.il_only().unwrap());
    assert_eq!(binary.company_name().unwrap().as_deref(), Some("Contoso Ltd"));
    assert_eq!(binary.legal_trademarks().unwrap().as_deref(), Some("TM"));
    assert_eq!(binary.assembly_version().unwrap(), FourPartVersion::new(2, 0, 0, 0));
    assert_eq!(binary.file_version().unwrap(), FourPartVersion::new(2, 1, 0, 0));
    assert_eq!(binary.product_version().unwrap(), FourPartVersion::new(2, 1, 0, 0));

    binary.set_company_name("Fabrikam").unwrap();
    assert_eq!(binary.company_name().unwrap().as_deref(), Some("Fabrikam"));
    binary.set_field(VersionField::LegalTrademarks, None).unwrap();
    assert_eq!(binary.legal_trademarks().unwrap(), None);
    assert!(binary.is_modified().unwrap());
}

#[test]
fn saved_version_resource_round_trips() {
    let workspace = Workspace::new();
    let path = workspace.file("tool.exe", &native_tool());
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();
    let original_md5 = binary.md5().unwrap();

    binary.set_company_name("Fabrikam").unwrap();
    binary.set_bug_tracker("https://bugs.fabrikam.test").unwrap();
    binary
        .set_file_version(FourPartVersion::new(3, 2, 1, 0))
        .unwrap();
    binary.save().unwrap();

    assert!(!binary.is_modified().unwrap());
    assert_ne!(binary.md5().unwrap(), original_md5);
    assert_eq!(
        binary.md5().unwrap(),
        format!("{:x}", Md5::digest(fs::read(&path).unwrap()))
    );

    let reloaded = workspace
        .fresh_registry()
        .load(&path, BinaryLoadOptions::ALL)
        .unwrap();
    assert_eq!(reloaded.company_name().unwrap().as_deref(), Some("Fabrikam"));
    assert_eq!(reloaded.product_name().unwrap().as_deref(), Some("Tools"));
    assert_eq!(
        reloaded.bug_tracker().unwrap().as_deref(),
        Some("https://bugs.fabrikam.test")
    );
    let version = reloaded.file_version_info().unwrap().unwrap();
    assert_eq!(version.fixed.file_version, FourPartVersion::new(3, 2, 1, 0));
    assert_eq!(version.get(VersionField::FileVersion), Some("3.2.1.0"));

    let bytes = fs::read(&path).unwrap();
    let pe = goblin::pe::PE::parse(&bytes).unwrap();
    assert!(!pe.is_64);
    assert!(pe.libraries.contains(&"KERNEL32.dll"));
}

#[test]
fn product_version_of_a_managed_library_is_saved() {
    let workspace = Workspace::new();
    let image = ImageBuilder::new()
        .managed("Contoso.Core", "1.0.0.0")
        .assembly_attribute(COMPANY_ATTRIBUTE, "Contoso")
        .build()
        .unwrap();
    let path = workspace.file("Contoso.Core.dll", &image);
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();
    assert!(binary.is_managed().unwrap());

    binary
        .set_product_version(FourPartVersion::new(2, 0, 0, 1))
        .unwrap();
    binary.save().unwrap();

    let reloaded = workspace
        .fresh_registry()
        .load(&path, BinaryLoadOptions::ALL)
        .unwrap();
    let version = reloaded.file_version_info().unwrap().unwrap();
    assert_eq!(version.get(VersionField::ProductVersion), Some("2.0.0.1"));
    assert_eq!(version.fixed.product_version, FourPartVersion::new(2, 0, 0, 1));
    assert_eq!(reloaded.product_version().unwrap(), FourPartVersion::new(2, 0, 0, 1));
    assert_eq!(reloaded.company_name().unwrap().as_deref(), Some("Contoso"));
    assert_eq!(
        reloaded.managed_assembly().unwrap().unwrap().name,
        "Contoso.Core"
    );
}

#[test]
fn version_resource_is_created_when_missing() {
    let workspace = Workspace::new();
    let path = workspace.file("bare.dll", &ImageBuilder::new().build().unwrap());
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();
    assert!(binary.file_version_info().unwrap().is_none());

    binary.set_product_name("Suite").unwrap();
    binary.save().unwrap();

    let version = binary.file_version_info().unwrap().unwrap();
    assert_eq!(version.get(VersionField::ProductName), Some("Suite"));
    assert_eq!(version.string_tables[0].key, "040904b0");
    assert_eq!(version.translations, vec![(0x0409, 0x04b0)]);
}

#[test]
fn manifest_edits_are_saved() {
    let workspace = Workspace::new();
    let path = workspace.file("tool.exe", &native_tool());
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();

    let manifest = binary.manifest().unwrap().unwrap();
    assert_eq!(manifest.requested_execution_level(), ExecutionLevel::None);
    assert!(!binary.is_modified().unwrap());

    binary
        .with_manifest(|manifest| {
            manifest.set_requested_execution_level(ExecutionLevel::RequireAdministrator);
        })
        .unwrap();
    assert!(binary.is_modified().unwrap());
    binary.save().unwrap();
    assert!(!binary.is_modified().unwrap());

    let reloaded = workspace
        .fresh_registry()
        .load(&path, BinaryLoadOptions::ALL)
        .unwrap();
    let manifest = reloaded.manifest().unwrap().unwrap();
    assert_eq!(
        manifest.requested_execution_level(),
        ExecutionLevel::RequireAdministrator
    );
    let table = reloaded.native_resources().unwrap().unwrap();
    let text = table.manifest_text().unwrap().unwrap();
    assert!(text.contains("requireAdministrator"));
}

#[test]
fn no_manifest_option_skips_the_model() {
    let workspace = Workspace::new();
    let path = workspace.file("tool.exe", &native_tool());
    let binary = workspace
        .registry
        .load(&path, BinaryLoadOptions::NO_MANIFEST)
        .unwrap();
    assert!(binary.manifest().unwrap().is_none());
    assert_eq!(binary.with_manifest(|_| ()).unwrap(), None);
}

#[test]
fn saving_strips_existing_signatures() {
    let workspace = Workspace::new();
    let image = ImageBuilder::new()
        .certificate(vec![0xAB; 64])
        .build()
        .unwrap();
    let path = workspace.file("signed.dll", &image);
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();
    assert!(binary.is_signed().unwrap());
    assert!(binary.is_valid_signed().unwrap());

    binary.set_comments("rebuilt").unwrap();
    binary.save().unwrap();
    assert!(!binary.is_signed().unwrap());
    assert!(!binary.is_valid_signed().unwrap());
    assert!(workspace.signer.calls().is_empty());
}

#[test]
fn unmodified_binaries_are_not_rewritten() {
    let workspace = Workspace::new();
    let image = native_tool();
    let path = workspace.file("tool.exe", &image);
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();

    let handle = binary.begin_save();
    assert!(handle.is_finished());
    handle.wait().unwrap();
    assert_eq!(fs::read(&path).unwrap(), image);
}

#[test]
fn unloaded_binaries_fail_fast() {
    let workspace = Workspace::new();
    let path = workspace.file("tool.exe", &native_tool());
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();
    let working = binary.working_copy().unwrap();
    assert!(working.exists());

    binary.unload();
    assert!(!working.exists());
    assert!(workspace.registry.get(&path).is_none());
    assert!(matches!(binary.is_managed(), Err(Error::Unloaded(_))));
    assert!(matches!(binary.company_name(), Err(Error::Unloaded(_))));
    assert!(matches!(binary.set_company_name("x"), Err(Error::Unloaded(_))));
    assert!(matches!(binary.working_copy(), Err(Error::Unloaded(_))));
    assert!(matches!(binary.is_modified(), Err(Error::Unloaded(_))));
    assert!(matches!(binary.signing_certificate(), Err(Error::Unloaded(_))));
    assert!(matches!(
        binary.strong_name_key_certificate(),
        Err(Error::Unloaded(_))
    ));
    assert!(binary.begin_save().wait().is_err());
}

#[test]
fn revert_discards_edits() {
    let workspace = Workspace::new();
    let path = workspace.file("tool.exe", &native_tool());
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();

    binary.set_company_name("Fabrikam").unwrap();
    assert!(binary.is_modified().unwrap());

    let reverted = binary.revert().unwrap();
    assert!(Arc::ptr_eq(&reverted, &binary));
    assert!(!binary.is_modified().unwrap());
    assert_eq!(binary.company_name().unwrap().as_deref(), Some("Contoso"));
    assert!(Arc::ptr_eq(&workspace.registry.get(&path).unwrap(), &binary));
    assert_eq!(workspace.working_copies().len(), 1);
}

#[test]
fn unload_and_reset_all_clears_the_registry() {
    let workspace = Workspace::new();
    let first = workspace.file("a.exe", &native_tool());
    let second = workspace.file("b.exe", &native_tool());
    let a = workspace.registry.load(&first, BinaryLoadOptions::ALL).unwrap();
    workspace.registry.load(&second, BinaryLoadOptions::ALL).unwrap();
    assert_eq!(workspace.registry.files().len(), 2);

    workspace.registry.unload_and_reset_all();
    assert!(workspace.registry.files().is_empty());
    assert!(workspace.working_copies().is_empty());
    assert!(matches!(a.md5(), Err(Error::Unloaded(_))));
}

#[test]
fn save_all_flushes_every_modified_binary() {
    let workspace = Workspace::new();
    let first = workspace.file("a.exe", &native_tool());
    let second = workspace.file("b.exe", &native_tool());
    let a = workspace.registry.load(&first, BinaryLoadOptions::ALL).unwrap();
    let b = workspace.registry.load(&second, BinaryLoadOptions::ALL).unwrap();

    a.set_product_name("A").unwrap();
    b.set_product_name("B").unwrap();
    workspace.registry.save_all().unwrap();

    assert!(workspace.registry.files().iter().all(|binary| !binary.is_modified().unwrap()));
    let fresh = workspace.fresh_registry();
    let a = fresh.load(&first, BinaryLoadOptions::ALL).unwrap();
    let b = fresh.load(&second, BinaryLoadOptions::ALL).unwrap();
    assert_eq!(a.product_name().unwrap().as_deref(), Some("A"));
    assert_eq!(b.product_name().unwrap().as_deref(), Some("B"));
}

#[test]
fn save_all_honours_the_timeout() {
    let workspace = Workspace::with(RecordingSigner::slow(Duration::from_millis(400)), |config| {
        config.with_save_timeout(Duration::from_millis(20))
    });
    let path = workspace.file("tool.exe", &native_tool());
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();
    binary.set_signing_certificate(common::certificate()).unwrap();

    let err = workspace.registry.save_all().unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    // Joins the save still in flight.
    binary.begin_save().wait().unwrap();
    assert!(!binary.is_modified().unwrap());
}

#[test]
fn concurrent_saves_share_one_run() {
    let workspace = Workspace::with(RecordingSigner::slow(Duration::from_millis(100)), |c| c);
    let path = workspace.file("tool.exe", &native_tool());
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();
    binary.set_signing_certificate(common::certificate()).unwrap();

    let first = binary.begin_save();
    let second = binary.begin_save();
    first.wait().unwrap();
    second.wait().unwrap();
    assert_eq!(workspace.signer.sign_calls().len(), 1);
}

#[test]
fn exhausted_timestamp_servers_fail_the_save() {
    let workspace = Workspace::with(RecordingSigner::failing_timestamps(), |c| c);
    let path = workspace.file("tool.exe", &native_tool());
    let binary = workspace.registry.load(&path, BinaryLoadOptions::ALL).unwrap();
    binary.set_signing_certificate(common::certificate()).unwrap();

    let err = binary.save().unwrap_err();
    assert!(err.is_timestamp_failure());
    match err.root() {
        Error::FailedTimestamp { url, .. } => assert_eq!(url, "All of them!"),
        other => panic!("unexpected {other:?}"),
    }

    let urls: Vec<String> = workspace
        .signer
        .sign_calls()
        .into_iter()
        .map(|call| match call {
            common::Call::Sign { url, .. } => url,
            common::Call::StrongName { .. } => unreachable!(),
        })
        .collect();
    assert_eq!(urls.len(), 6);
    assert_eq!(urls[0], "http://ts-a.test");
    assert_eq!(urls[1], "http://ts-b.test");
    assert_eq!(urls[4], "http://ts-a.test");
    assert!(binary.is_modified().unwrap());
}

#[test]
fn no_signature_option_skips_signing() {
    let workspace = Workspace::new();
    let path = workspace.file("tool.exe", &native_tool());
    let binary = workspace
        .registry
        .load(&path, BinaryLoadOptions::ALL | BinaryLoadOptions::NO_SIGNATURE)
        .unwrap();
    binary.set_signing_certificate(common::certificate()).unwrap();
    binary.save().unwrap();
    assert!(workspace.signer.calls().is_empty());
}

#[test]
fn managed_flags_follow_the_runtime_header() {
    let workspace = Workspace::new();
    let image = ImageBuilder::new()
        .pe32_plus()
        .machine(0x8664)
        .managed("Tool", "1.0.0.0")
        .cor_flags(Cor20Header::FLAG_IL_ONLY | Cor20Header::FLAG_32BIT_REQUIRED)
        .build()
        .unwrap();
    let path = workspace.file("Tool.exe", &image);
    let binary = workspace
        .registry
        .load(&path, BinaryLoadOptions::DELAY_LOAD)
        .unwrap();

    assert!(binary.is_64bit_pe().unwrap());
    assert!(binary.is_64bit().unwrap());
    assert!(binary.is_32bit().unwrap());
    assert!(!binary.is_any_cpu().unwrap());
    assert_eq!(
        binary.executable_info().unwrap(),
        ExecutableInfo::MANAGED | ExecutableInfo::X64
    );
    let assembly = binary.managed_assembly().unwrap().unwrap();
    assert_eq!(assembly.name, "Tool");
    assert!(binary.assembly_references().unwrap().is_empty());
}

#[test]
fn no_managed_option_hides_the_assembly() {
    let workspace = Workspace::new();
    let image = ImageBuilder::new()
        .managed("Tool", "1.0.0.0")
        .assembly_attribute(COMPANY_ATTRIBUTE, "Contoso")
        .build()
        .unwrap();
    let path = workspace.file("Tool.dll", &image);
    let binary = workspace
        .registry
        .load(&path, BinaryLoadOptions::NO_MANAGED)
        .unwrap();

    assert!(binary.is_managed().unwrap());
    assert!(binary.managed_assembly().unwrap().is_none());
    assert_eq!(binary.company_name().unwrap(), None);
}
