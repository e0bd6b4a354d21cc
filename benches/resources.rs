//! Benchmarks for the resource section: reading the tree, decoding `VS_VERSIONINFO` and
//! rebuilding the section the way a save does.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use pesmith::{
    pe::{ImageBuilder, PeImage},
    resources::{ResourceTable, VersionField, VersionResource},
};
use std::hint::black_box;

const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
  <assemblyIdentity name="Contoso.Tool" version="1.0.0.0" type="win32"/>
</assembly>"#;

fn sample_image() -> Vec<u8> {
    let mut builder = ImageBuilder::new().manifest(MANIFEST);
    for field in [
        (VersionField::CompanyName, "Contoso"),
        (VersionField::ProductName, "Contoso Suite"),
        (VersionField::FileDescription, "Command line tool"),
        (VersionField::FileVersion, "1.2.3.4"),
        (VersionField::ProductVersion, "1.2.0.0"),
        (VersionField::LegalCopyright, "(c) Contoso"),
    ] {
        builder = builder.version_field(field.0, field.1);
    }
    builder.build().expect("Failed to build sample image")
}

/// Reading the whole tree and decoding the version resource
fn bench_read(c: &mut Criterion) {
    let image = PeImage::new(sample_image()).expect("Failed to parse sample image");

    let mut group = c.benchmark_group("resources_read");
    group.throughput(Throughput::Bytes(image.data().len() as u64));
    group.bench_function("read_tree", |b| {
        b.iter(|| {
            let table = ResourceTable::read(black_box(image.data()), image.headers()).unwrap();
            black_box(table)
        });
    });
    group.bench_function("read_version", |b| {
        let table = ResourceTable::read(image.data(), image.headers()).unwrap();
        b.iter(|| black_box(table.version().unwrap()));
    });
    group.finish();
}

/// Regenerating the version resource and writing a fresh section
fn bench_rewrite(c: &mut Criterion) {
    let image = PeImage::new(sample_image()).expect("Failed to parse sample image");
    let table = ResourceTable::read(image.data(), image.headers()).unwrap();

    c.bench_function("resources_rewrite", |b| {
        b.iter(|| {
            let mut table = table.clone();
            let mut version = table.version().unwrap().unwrap_or_else(VersionResource::new);
            version.set(VersionField::CompanyName, Some("Fabrikam"));
            table.set_version(&version).unwrap();

            let mut image = image.clone();
            table.write_into(&mut image).unwrap();
            black_box(image)
        });
    });
}

criterion_group!(benches, bench_read, bench_rewrite);
criterion_main!(benches);
