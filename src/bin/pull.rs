//! Pull CLI entrypoint.
//!
//! `objsync-pull REMOTE [BRANCH|CHECKSUM ...]` downloads the requested
//! closure from the named remote into the local repository. The remote
//! must be configured in the repo's config file under `remote "NAME"`
//! with a `url=` key; `file://` URLs use the directory backend, anything
//! else goes through HTTP.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use objsync::{
    run_pull, DirBackend, FetchBackend, FsStore, HttpBackend, ObjectStore, PullOptions,
};

/// Print usage and flag summary to stderr.
fn print_usage(exe: &std::ffi::OsStr) {
    eprintln!(
        "usage: {} [OPTIONS] <remote> [branch-or-checksum...]

Download data from a remote repository.

OPTIONS:
    --repo=<path>   Local repository path (default: .)
    --related       Also download commits listed as related
    -v, --verbose   Show more information
    --help, -h      Show this help message",
        exe.to_string_lossy()
    );
}

fn main() -> ExitCode {
    let mut args = env::args_os();
    let exe = args.next().unwrap_or_else(|| "objsync-pull".into());

    let mut repo = PathBuf::from(".");
    let mut remote: Option<String> = None;
    let mut refs: Vec<String> = Vec::new();
    let mut related = false;
    let mut verbose = false;

    for arg in args {
        let Some(text) = arg.to_str() else {
            eprintln!("arguments must be valid UTF-8");
            return ExitCode::from(2);
        };
        if let Some(value) = text.strip_prefix("--repo=") {
            repo = PathBuf::from(value);
            continue;
        }
        match text {
            "--related" => related = true,
            "-v" | "--verbose" => verbose = true,
            "--help" | "-h" => {
                print_usage(&exe);
                return ExitCode::SUCCESS;
            }
            _ if text.starts_with('-') => {
                eprintln!("unknown flag: {text}");
                print_usage(&exe);
                return ExitCode::from(2);
            }
            _ => {
                if remote.is_none() {
                    remote = Some(text.to_string());
                } else {
                    refs.push(text.to_string());
                }
            }
        }
    }

    let Some(remote) = remote else {
        eprintln!("REMOTE must be specified");
        print_usage(&exe);
        return ExitCode::from(2);
    };

    let store = match FsStore::open(&repo) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let config = match store.config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let url = match config.require_string(&format!("remote \"{remote}\""), "url") {
        Ok(url) => url.to_string(),
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let backend: Arc<dyn FetchBackend> = if url.starts_with("file://") {
        Arc::new(DirBackend)
    } else {
        match HttpBackend::new() {
            Ok(backend) => Arc::new(backend),
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::FAILURE;
            }
        }
    };

    let mut options = PullOptions::new(&remote);
    options.refs = refs;
    options.related = related;
    options.verbose = verbose;

    match run_pull(store, backend, options) {
        Ok(report) => {
            for branch in &report.unchanged_refs {
                println!("No changes in {remote}/{branch}");
            }
            for (branch, csum) in &report.updated_refs {
                println!("remote {remote}/{branch} is now {csum}");
            }
            if report.bytes_transferred > 0 {
                let (amount, unit) = if report.bytes_transferred < 1024 {
                    (report.bytes_transferred, "B")
                } else {
                    (report.bytes_transferred / 1024, "KiB")
                };
                println!(
                    "{} metadata, {} content objects fetched; {amount} {unit} transferred in {} seconds",
                    report.n_fetched_metadata,
                    report.n_fetched_content,
                    report.elapsed.as_secs()
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
