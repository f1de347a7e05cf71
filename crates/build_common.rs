// Build-script helper shared by every workspace crate: turns the crate's
// README.md into the crate-level rustdoc.
// Include it from build.rs with: include!("../build_common.rs");
//
// The including file must import:
//   use std::env;
//   use std::fs;
//   use std::path::Path;

/// Write `README_GENERATED.md` to `OUT_DIR` for `#![doc = include_str!(..)]`.
///
/// Links into `src/` are rewritten to module links (`src/gate.rs` becomes
/// `gate`) so rustdoc resolves them. Without a README the crate description
/// from Cargo.toml is used, so the `include_str!` always finds a file.
fn process_readme_for_rustdoc(crate_dir: &str) {
    println!("cargo:rerun-if-changed=README.md");

    let out_dir = env::var("OUT_DIR").expect("cargo sets OUT_DIR for build scripts");
    let dest = Path::new(&out_dir).join("README_GENERATED.md");

    let readme = Path::new(crate_dir).join("README.md");
    let doc = match fs::read_to_string(&readme) {
        Ok(content) => rustdoc_links(&content),
        Err(_) => {
            let name = env::var("CARGO_PKG_NAME").unwrap_or_default();
            let description = env::var("CARGO_PKG_DESCRIPTION").unwrap_or_default();
            format!("# {name}\n\n{description}\n")
        }
    };

    fs::write(&dest, doc).expect("OUT_DIR is writable");
}

/// Point `](src/...rs)` links at modules instead of files.
fn rustdoc_links(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut rest = markdown;
    while let Some(start) = rest.find("](src/") {
        out.push_str(&rest[..start]);
        out.push_str("](");
        rest = &rest[start + "](src/".len()..];
        let end = rest.find(')').unwrap_or(rest.len());
        let target = &rest[..end];
        let module = target
            .strip_suffix("/mod.rs")
            .or_else(|| target.strip_suffix(".rs"))
            .unwrap_or(target);
        out.push_str(module);
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}
