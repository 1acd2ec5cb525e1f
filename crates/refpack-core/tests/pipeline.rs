//! End-to-end runs over module images on disk.

use pretty_assertions::assert_eq;
use refpack_core::module::{
    known, AttributeArg, CustomAttribute, EventDef, FieldAttributes, FieldDef, MethodAttributes,
    MethodBody, MethodDef, MethodImplAttributes, PropertyDef, TypeAttributes, TypeDef, TypeName,
    TypeSig,
};
use refpack_core::{
    create_reference_module, image, FilterMode, Module, NoPublish, PackageAssembler,
    PackageSettings, Pipeline, RunSettings, StripPolicy, StripperKind, VersionSpec,
};
use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn body() -> MethodBody {
    MethodBody::new(vec![0x00, 0x2A])
}

fn ctor() -> MethodDef {
    MethodDef::new(
        ".ctor",
        MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME | MethodAttributes::RT_SPECIAL_NAME,
    )
    .with_body(body())
}

fn handler() -> TypeSig {
    TypeSig::core("System.EventHandler")
}

/// A module exercising every visibility and member kind
fn library(name: &str, version: VersionSpec) -> Module {
    let mut module = Module::new(name, version);
    module.assembly_attributes.push(
        CustomAttribute::new(TypeName::core("System.Reflection.AssemblyTitleAttribute"))
            .with_arg(AttributeArg::String(name.into())),
    );
    module
        .assembly_attributes
        .push(CustomAttribute::new("Lib.Weaving.WovenAttribute"));

    module.add_type(
        TypeDef::new("Lib.Weaving", "WovenAttribute", TypeAttributes::NOT_PUBLIC)
            .extends(TypeSig::core("System.Attribute"))
            .with_method(ctor()),
    );
    let api = module.add_type(
        TypeDef::new("Lib", "Api", TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT)
            .with_attribute(CustomAttribute::new("Lib.Weaving.WovenAttribute"))
            .with_field(FieldDef::new("state", FieldAttributes::PRIVATE, "Lib.State"))
            .with_field(FieldDef::new("Limit", FieldAttributes::PUBLIC, "System.Int32"))
            .with_method(ctor())
            .with_method(
                MethodDef::new("Run", MethodAttributes::PUBLIC)
                    .param("count", "System.Int32")
                    .returns("System.Boolean")
                    .with_body(body())
                    .with_attribute(CustomAttribute::new("Lib.Weaving.WovenAttribute")),
            )
            .with_method(MethodDef::new("OnRun", MethodAttributes::FAMILY).with_body(body()))
            .with_method(MethodDef::new("Helper", MethodAttributes::ASSEMBLY).with_body(body()))
            .with_method(MethodDef::new("Secret", MethodAttributes::PRIVATE).with_body(body()))
            .with_method(
                MethodDef::new(
                    "Describe",
                    MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL | MethodAttributes::ABSTRACT,
                )
                .returns("System.String"),
            )
            .with_method(
                MethodDef::new("Native", MethodAttributes::PUBLIC | MethodAttributes::STATIC)
                    .with_impl_flags(MethodImplAttributes::INTERNAL_CALL),
            )
            .with_method(
                MethodDef::new("get_Name", MethodAttributes::PUBLIC)
                    .returns(TypeSig::String)
                    .with_body(body()),
            )
            .with_method(
                MethodDef::new("set_Name", MethodAttributes::PRIVATE)
                    .param("value", TypeSig::String)
                    .with_body(body()),
            )
            .with_method(
                MethodDef::new("add_Changed", MethodAttributes::ASSEMBLY)
                    .param("value", handler())
                    .with_body(body()),
            )
            .with_method(
                MethodDef::new("remove_Changed", MethodAttributes::ASSEMBLY)
                    .param("value", handler())
                    .with_body(body()),
            )
            .with_property(
                PropertyDef::new("Name", "System.String")
                    .getter("get_Name")
                    .setter("set_Name"),
            )
            .with_event(
                EventDef::new("Changed", handler())
                    .accessors_named("add_Changed", "remove_Changed"),
            ),
    );
    module.add_type(
        TypeDef::new("", "Options", TypeAttributes::NESTED_PUBLIC)
            .nested_in(api)
            .with_method(ctor()),
    );
    let hidden = module.add_type(
        TypeDef::new("", "Cache", TypeAttributes::NESTED_PRIVATE)
            .nested_in(api)
            .with_method(MethodDef::new("Clear", MethodAttributes::PUBLIC).with_body(body())),
    );
    module.add_type(TypeDef::new("", "Entry", TypeAttributes::NESTED_PUBLIC).nested_in(hidden));
    module.add_type(
        TypeDef::new("Lib", "State", TypeAttributes::NOT_PUBLIC)
            .with_field(FieldDef::new("ticks", FieldAttributes::PRIVATE, "System.Int64"))
            .with_method(MethodDef::new("Tick", MethodAttributes::ASSEMBLY).with_body(body())),
    );
    module.add_type(
        TypeDef::value_type("Lib", "Handle", TypeAttributes::PUBLIC | TypeAttributes::SEQUENTIAL_LAYOUT)
            .with_field(FieldDef::new("value", FieldAttributes::PRIVATE, "System.IntPtr"))
            .with_field(FieldDef::new("owner", FieldAttributes::PRIVATE, "System.Object")),
    );
    module.add_type(TypeDef::new("Lib", "Internals", TypeAttributes::NOT_PUBLIC).with_method(
        MethodDef::new("Boot", MethodAttributes::PUBLIC | MethodAttributes::STATIC).with_body(body()),
    ));
    module
}

fn write_library(path: &Path, name: &str, version: VersionSpec) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, image::encode(&library(name, version)).unwrap()).unwrap();
}

fn strip(dir: &Path, source: &Path, policy: &StripPolicy, kind: StripperKind, out: &str) -> Module {
    let strategy = kind.build(policy.clone());
    let target = dir.join(out).join(source.file_name().unwrap());
    create_reference_module(strategy.as_ref(), source, &target).unwrap();
    image::read_file(&target).unwrap()
}

fn policy(mode: FilterMode, omit: bool) -> StripPolicy {
    StripPolicy {
        filter_mode: mode,
        omit_non_api_members: omit,
        ..StripPolicy::default()
    }
}

fn read_entry(archive: &Path, name: &str) -> Vec<u8> {
    let mut zip = zip::ZipArchive::new(fs::File::open(archive).unwrap()).unwrap();
    let mut data = Vec::new();
    zip.by_name(name).unwrap().read_to_end(&mut data).unwrap();
    data
}

fn run(root: &Path, aggregate: bool, boost: VersionSpec, sources: &[PathBuf]) -> refpack_core::RunReport {
    let pipeline = Pipeline::new(
        RunSettings {
            source_root: root.join("game"),
            module_output_dir: root.join("Public"),
            package_output_dir: root.join("Packages"),
            aggregate,
        },
        StripperKind::Filtering.build(policy(FilterMode::Public, false)),
        PackageAssembler::new(PackageSettings {
            version_boost: boost,
            ..PackageSettings::default()
        }),
    );
    pipeline.run(sources, &mut NoPublish).unwrap()
}

#[test]
fn test_lib_with_boost_produces_versioned_reference_package() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("game").join("Lib.dll");
    write_library(&source, "Lib", VersionSpec::full(1, 4, 0, 0));

    let report = run(dir.path(), false, VersionSpec::major_minor(0, 1), &[source]);
    let package = dir.path().join("Packages").join("Lib.nupkg");
    assert_eq!(report.packages, vec![package.clone()]);
    assert!(report.is_clean());

    let nuspec = String::from_utf8(read_entry(&package, "Lib.nuspec")).unwrap();
    assert!(nuspec.contains("<version>1.5.0.0</version>"));
    assert!(nuspec.contains("<title>Stripped Lib Reference</title>"));

    let stripped = image::decode(&read_entry(&package, "ref/Lib.dll")).unwrap();
    let declarations = stripped.declarations();
    for expected in [
        "T:Lib.Api",
        "T:Lib.Api/Options",
        "T:Lib.Handle",
        "M:Lib.Api::Run(System.Int32)~System.Boolean",
        "M:Lib.Api::OnRun()~System.Void",
        "M:Lib.Api::Describe()~System.String",
        "P:Lib.Api::Name",
        "F:Lib.Api::Limit",
    ] {
        assert!(declarations.contains(expected), "missing {expected}");
    }
    for gone in [
        "T:Lib.Api/Cache",
        "T:Lib.Api/Cache/Entry",
        "T:Lib.Internals",
        "M:Lib.Api::Helper()~System.Void",
        "M:Lib.Api::Secret()~System.Void",
        "E:Lib.Api::Changed",
    ] {
        assert!(!declarations.contains(gone), "unexpected {gone}");
    }
    assert!(stripped.has_assembly_attribute(known::REFERENCE_ASSEMBLY));
    for ty in &stripped.types {
        for method in &ty.methods {
            if let Some(body) = &method.body {
                assert!(body.throws_immediately(), "{} still runs", method.name);
            }
        }
    }
}

#[test]
fn test_stripping_a_reference_module_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("Lib.dll");
    write_library(&source, "Lib", VersionSpec::full(1, 0, 0, 0));

    for (index, omit) in [false, true].into_iter().enumerate() {
        for mode in [FilterMode::Auto, FilterMode::Public, FilterMode::PublicAndInternal, FilterMode::All] {
            let mut policy = policy(mode, omit);
            policy.make_mock = index == 1;
            let first = strip(dir.path(), &source, &policy, StripperKind::Filtering, "first");
            let first_path = dir.path().join("first").join("Lib.dll");
            let second = strip(dir.path(), &first_path, &policy, StripperKind::Filtering, "second");
            assert_eq!(second.declarations(), first.declarations(), "{mode:?} omit={omit}");
            assert_eq!(second, first, "{mode:?} omit={omit}");
        }
    }
}

#[test]
fn test_stricter_modes_keep_subsets() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("Lib.dll");
    write_library(&source, "Lib", VersionSpec::full(1, 0, 0, 0));

    for omit in [false, true] {
        let surface = |mode| -> BTreeSet<String> {
            strip(dir.path(), &source, &policy(mode, omit), StripperKind::Filtering, "modes")
                .declarations()
        };
        let public = surface(FilterMode::Public);
        let internal = surface(FilterMode::PublicAndInternal);
        let all = surface(FilterMode::All);
        assert!(public.is_subset(&internal), "omit={omit}");
        assert!(internal.is_subset(&all), "omit={omit}");
        assert!(public.len() < internal.len());
        assert_eq!(all, library("Lib", VersionSpec::EMPTY).declarations());
    }
}

#[test]
fn test_omitting_non_api_members_keeps_value_type_shape() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("Lib.dll");
    write_library(&source, "Lib", VersionSpec::full(1, 0, 0, 0));

    let stripped = strip(
        dir.path(),
        &source,
        &policy(FilterMode::Public, true),
        StripperKind::Filtering,
        "omit",
    );
    let handle = stripped.type_named("Lib.Handle").unwrap();
    assert_eq!(handle.fields.len(), 1);
    assert_eq!(handle.fields[0].name, "value");
    assert!(stripped.type_named("Lib.State").is_none());
    assert!(!stripped.declarations().contains("F:Lib.Api::state"));
}

#[test]
fn test_auto_mode_follows_internals_visible_to() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("Lib.dll");
    let mut module = library("Lib", VersionSpec::full(1, 0, 0, 0));
    module.assembly_attributes.push(
        CustomAttribute::new(TypeName::core(known::INTERNALS_VISIBLE_TO))
            .with_arg(AttributeArg::String("Lib.Tests, PublicKey=0024".into())),
    );
    fs::write(&source, image::encode(&module).unwrap()).unwrap();

    let stripped = strip(
        dir.path(),
        &source,
        &policy(FilterMode::Auto, false),
        StripperKind::Filtering,
        "auto",
    );
    assert!(stripped.type_named("Lib.Internals").is_some());
    assert!(stripped.type_named("Lib.Api/Cache").is_none());
}

#[test]
fn test_neutralized_methods_keep_their_signatures() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("Lib.dll");
    write_library(&source, "Lib", VersionSpec::full(1, 0, 0, 0));
    let original = library("Lib", VersionSpec::full(1, 0, 0, 0));

    for (kind, mode) in [
        (StripperKind::BodiesOnly, FilterMode::Public),
        (StripperKind::Filtering, FilterMode::All),
    ] {
        let mut policy = policy(mode, false);
        policy.make_mock = true;
        let stripped = strip(dir.path(), &source, &policy, kind, "bodies");

        for ty in &original.types {
            let owner = original.full_name(ty);
            let kept = stripped.type_named(&owner).unwrap();
            for method in ty.methods.iter().filter(|m| m.has_body()) {
                let after = kept
                    .methods
                    .iter()
                    .find(|m| m.token == method.token)
                    .unwrap();
                assert_eq!(after.signature, method.signature);
                assert_eq!(after.flags, method.flags);
                assert!(after.body.as_ref().unwrap().throws_immediately());
            }
            for method in ty.methods.iter().filter(|m| !m.has_body()) {
                let after = kept.methods.iter().find(|m| m.token == method.token).unwrap();
                assert_eq!(after.body, None);
            }
        }
    }
}

#[test]
fn test_removed_types_take_their_applications_along() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("Lib.dll");
    write_library(&source, "Lib", VersionSpec::full(1, 0, 0, 0));

    let mut policy = policy(FilterMode::All, false);
    policy.remove_types = BTreeSet::from(["Lib.Weaving.WovenAttribute".to_string()]);
    let stripped = strip(dir.path(), &source, &policy, StripperKind::BodiesOnly, "scrub");

    assert!(stripped.type_named("Lib.Weaving.WovenAttribute").is_none());
    let applied = stripped
        .assembly_attributes
        .iter()
        .chain(stripped.types.iter().flat_map(|t| {
            t.attributes
                .iter()
                .chain(t.methods.iter().flat_map(|m| m.attributes.iter()))
        }))
        .filter(|a| a.is("Lib.Weaving.WovenAttribute"))
        .count();
    assert_eq!(applied, 0);
    assert!(stripped.type_named("Lib.Api").is_some());
}

#[test]
fn test_aggregate_package_prefers_the_shallowest_module() {
    let dir = TempDir::new().unwrap();
    let deep = dir.path().join("game").join("mods").join("old").join("Foo.dll");
    let shallow = dir.path().join("game").join("Foo.dll");
    let other = dir.path().join("game").join("mods").join("Bar.dll");
    write_library(&deep, "FooOld", VersionSpec::full(0, 9, 0, 0));
    write_library(&shallow, "Foo", VersionSpec::full(1, 0, 0, 0));
    write_library(&other, "Bar", VersionSpec::full(1, 0, 0, 0));

    let report = run(
        dir.path(),
        true,
        VersionSpec::EMPTY,
        &[deep.clone(), other, shallow],
    );
    assert_eq!(report.duplicates.len(), 1);
    assert_eq!(report.duplicates[0].skipped, deep);

    let package = dir.path().join("Packages").join("AllReferences.nupkg");
    let foo = image::decode(&read_entry(&package, "ref/Foo.dll")).unwrap();
    assert_eq!(foo.name, "Foo");
    let bar = image::decode(&read_entry(&package, "ref/Bar.dll")).unwrap();
    assert_eq!(bar.name, "Bar");
}

#[test]
fn test_identical_runs_produce_identical_packages() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let mut archives = Vec::new();
    for dir in [&first, &second] {
        let source = dir.path().join("game").join("Lib.dll");
        write_library(&source, "Lib", VersionSpec::full(1, 4, 0, 0));
        fs::write(dir.path().join("game").join("Lib.xml"), b"<doc/>").unwrap();
        run(dir.path(), false, VersionSpec::EMPTY, &[source]);
        archives.push(fs::read(dir.path().join("Packages").join("Lib.nupkg")).unwrap());
    }
    assert_eq!(archives[0], archives[1]);
    assert_eq!(
        read_entry(&first.path().join("Packages").join("Lib.nupkg"), "ref/Lib.xml"),
        b"<doc/>"
    );
}
