// build.rs

/// This build script decides which readiness backends get compiled, based on:
/// 1. EVQ_BACKEND environment variable (highest priority, restricts to one backend)
/// 2. Enabled Cargo features (epoll, kqueue)
/// 3. What the target OS actually provides
///
/// It emits `evq_epoll` / `evq_kqueue` cfg flags for conditional compilation.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=EVQ_BACKEND");

    // Declare custom cfg names to avoid warnings
    println!("cargo::rustc-check-cfg=cfg(evq_epoll)");
    println!("cargo::rustc-check-cfg=cfg(evq_kqueue)");

    let target_os = std::env::var("CARGO_CFG_TARGET_OS")
        .expect("CARGO_CFG_TARGET_OS is not set, cannot determine target platform.");

    let has_epoll = target_has_epoll(&target_os);
    let has_kqueue = target_has_kqueue(&target_os);

    let want_epoll = std::env::var("CARGO_FEATURE_EPOLL").is_ok();
    let want_kqueue = std::env::var("CARGO_FEATURE_KQUEUE").is_ok();

    let (want_epoll, want_kqueue) = match std::env::var("EVQ_BACKEND") {
        Ok(backend) => match backend.to_lowercase().as_str() {
            "epoll" => {
                if !has_epoll {
                    panic!("EVQ_BACKEND=epoll but target '{}' has no epoll", target_os);
                }
                println!("cargo:warning=Building only the epoll backend (EVQ_BACKEND)");
                (true, false)
            }
            "kqueue" => {
                if !has_kqueue {
                    panic!("EVQ_BACKEND=kqueue but target '{}' has no kqueue", target_os);
                }
                println!("cargo:warning=Building only the kqueue backend (EVQ_BACKEND)");
                (false, true)
            }
            _ => panic!(
                "Invalid EVQ_BACKEND value: '{}'. Must be one of: epoll, kqueue",
                backend
            ),
        },
        Err(_) => (want_epoll, want_kqueue),
    };

    if want_epoll && has_epoll {
        println!("cargo:rustc-cfg=evq_epoll");
    }
    if want_kqueue && has_kqueue {
        println!("cargo:rustc-cfg=evq_kqueue");
    }
}

fn target_has_epoll(target_os: &str) -> bool {
    matches!(target_os, "linux" | "android")
}

fn target_has_kqueue(target_os: &str) -> bool {
    matches!(
        target_os,
        "macos" | "ios" | "freebsd" | "netbsd" | "openbsd" | "dragonfly"
    )
}
