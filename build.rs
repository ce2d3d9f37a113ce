//! Build script for denoise-rt
//!
//! With the `cuda` feature, compiles `src/runtime/cuda/kernels/unet.cu` to PTX
//! in `OUT_DIR` and exports the directory as `CUDA_KERNEL_DIR`.
//!
//! `CUDA_PATH` overrides the toolkit location; otherwise common install paths
//! and `PATH` are searched for `nvcc`.

fn main() {
    #[cfg(feature = "cuda")]
    compile_cuda_kernels();
}

#[cfg(feature = "cuda")]
fn compile_cuda_kernels() {
    use std::env;
    use std::path::PathBuf;
    use std::process::Command;

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let source = PathBuf::from("src/runtime/cuda/kernels/unet.cu");
    let ptx = out_dir.join("unet.ptx");

    println!("cargo:rerun-if-changed={}", source.display());
    println!("cargo:rerun-if-env-changed=CUDA_PATH");

    if !source.exists() {
        panic!("CUDA kernel source not found: {}", source.display());
    }

    let nvcc = find_nvcc().unwrap_or_else(|| {
        panic!(
            "nvcc not found: install the CUDA Toolkit and add nvcc to PATH, \
             or set CUDA_PATH (for example /usr/local/cuda)"
        )
    });

    // sm_70 PTX; the driver JITs it for newer architectures
    let output = Command::new(&nvcc)
        .arg("-ptx")
        .arg("-O3")
        .arg("-arch=sm_70")
        .arg("-o")
        .arg(&ptx)
        .arg(&source)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute {nvcc}: {e}"));

    if !output.status.success() {
        panic!(
            "nvcc failed for {}:\n{}{}",
            source.display(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    println!("cargo:rustc-env=CUDA_KERNEL_DIR={}", out_dir.display());
}

#[cfg(feature = "cuda")]
fn find_nvcc() -> Option<String> {
    use std::path::PathBuf;
    use std::process::Command;

    if let Ok(cuda_path) = std::env::var("CUDA_PATH") {
        let bin = PathBuf::from(cuda_path).join("bin");
        for name in ["nvcc", "nvcc.exe"] {
            let nvcc = bin.join(name);
            if nvcc.exists() {
                return Some(nvcc.to_string_lossy().into_owned());
            }
        }
    }

    ["/usr/local/cuda/bin/nvcc", "/opt/cuda/bin/nvcc"]
        .into_iter()
        .find(|p| std::path::Path::new(p).exists())
        .map(str::to_string)
        .or_else(|| {
            Command::new("nvcc")
                .arg("--version")
                .output()
                .ok()
                .map(|_| "nvcc".to_string())
        })
}
