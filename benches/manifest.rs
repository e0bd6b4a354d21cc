//! Benchmarks for parsing, editing and serializing application manifests.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use pesmith::manifest::{ExecutionLevel, NativeManifest, SupportedOs};
use std::hint::black_box;

const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
  <assemblyIdentity name="Contoso.Tool" version="1.0.0.0" processorArchitecture="amd64" type="win32"/>
  <trustInfo xmlns="urn:schemas-microsoft-com:asm.v3">
    <security>
      <requestedPrivileges>
        <requestedExecutionLevel level="asInvoker" uiAccess="false"/>
      </requestedPrivileges>
    </security>
  </trustInfo>
  <compatibility xmlns="urn:schemas-microsoft-com:compatibility.v1">
    <application>
      <supportedOS Id="{35138b9a-5d96-4fbd-8e2d-a2440225f93a}"/>
    </application>
  </compatibility>
  <dependency>
    <dependentAssembly>
      <assemblyIdentity type="win32" name="Microsoft.Windows.Common-Controls" version="6.0.0.0" processorArchitecture="*" publicKeyToken="6595b64144ccf1df" language="*"/>
    </dependentAssembly>
  </dependency>
</assembly>"#;

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest");
    group.throughput(Throughput::Bytes(MANIFEST.len() as u64));
    group.bench_function("parse", |b| {
        b.iter(|| black_box(NativeManifest::parse(black_box(MANIFEST)).unwrap()));
    });

    let manifest = NativeManifest::parse(MANIFEST).unwrap();
    group.bench_function("to_xml", |b| {
        b.iter(|| black_box(manifest.to_xml().unwrap()));
    });
    group.finish();
}

fn bench_edit(c: &mut Criterion) {
    let manifest = NativeManifest::parse(MANIFEST).unwrap();
    c.bench_function("manifest_edit_and_serialize", |b| {
        b.iter(|| {
            let mut manifest = manifest.clone();
            manifest.set_requested_execution_level(ExecutionLevel::RequireAdministrator);
            manifest.set_dpi_aware(true);
            manifest.set_supported_os(SupportedOs::Win8, true);
            black_box(manifest.to_xml().unwrap())
        });
    });
}

criterion_group!(benches, bench_parse, bench_edit);
criterion_main!(benches);
