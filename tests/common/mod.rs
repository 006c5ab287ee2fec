use std::path::PathBuf;

use tempfile::tempdir;

pub fn with_tmp_dir<F: Fn(PathBuf)>(body: F) {
    env_logger::try_init().ok();
    let dir = tempdir().expect("failed to create a temporary directory");
    body(dir.path().to_path_buf());
}

pub fn with_tmp_path<F: Fn(PathBuf)>(body: F) {
    with_tmp_dir(|dir| body(dir.join("test.h5dfs")));
}
