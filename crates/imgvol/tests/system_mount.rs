//! Kernel mount tests. Need root: `cargo test --features integration`.
#![cfg(all(feature = "integration", target_os = "linux"))]

use std::fs;

use imgvol::filesystem::{LayerView, Mount, Mounter, SystemMounter};

#[tokio::test]
async fn bind_view_is_read_only_and_peels_off() {
    let temp = tempfile::tempdir().unwrap();
    let layer = temp.path().join("layer");
    let target = temp.path().join("target");
    fs::create_dir_all(layer.join("etc")).unwrap();
    fs::write(layer.join("etc/motd"), "hello\n").unwrap();
    fs::create_dir(&target).unwrap();

    let mounter = SystemMounter;
    mounter
        .apply_mounts(&[Mount::bind(&layer, true)], &target)
        .await
        .unwrap();

    assert_eq!(fs::read_to_string(target.join("etc/motd")).unwrap(), "hello\n");
    assert!(fs::write(target.join("etc/new"), "x").is_err());

    mounter.unmount_all(&target).await.unwrap();
    assert!(!target.join("etc").exists());
    // Nothing left to unmount.
    mounter.unmount_all(&target).await.unwrap();
}

#[tokio::test]
async fn overlay_view_merges_layers_top_first() {
    let temp = tempfile::tempdir().unwrap();
    let bottom = temp.path().join("bottom");
    let top = temp.path().join("top");
    let target = temp.path().join("target");
    for dir in [&bottom, &top, &target] {
        fs::create_dir(dir).unwrap();
    }
    fs::write(bottom.join("a"), "bottom").unwrap();
    fs::write(bottom.join("b"), "bottom").unwrap();
    fs::write(top.join("a"), "top").unwrap();

    let view = LayerView::new(vec![top, bottom]);
    let mounter = SystemMounter;
    mounter.apply_mounts(&view.mounts(), &target).await.unwrap();

    assert_eq!(fs::read_to_string(target.join("a")).unwrap(), "top");
    assert_eq!(fs::read_to_string(target.join("b")).unwrap(), "bottom");

    mounter.unmount_all(&target).await.unwrap();
    assert!(!target.join("a").exists());
}
