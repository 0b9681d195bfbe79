use motion_core::morphology::{close, edge_map};
use motion_core::prepare::{prepare_subframe, to_gray_image};
use motion_core::{
    BackgroundModel, BoundingBox, DEFAULT_DIFF_THRESHOLD, Mat, TrackerRegistry, find_regions,
};

const WIDTH: u32 = 160;
const HEIGHT: u32 = 120;

/// Flat grey BGR scene with a textured 24x24 object at `(x, y)`.
fn scene(object: Option<(u32, u32)>) -> Vec<u8> {
    let mut bgr = vec![60u8; (WIDTH * HEIGHT * 3) as usize];
    if let Some((ox, oy)) = object {
        for dy in 0..24 {
            for dx in 0..24 {
                let idx = (((oy + dy) * WIDTH + ox + dx) * 3) as usize;
                let value = if (4..20).contains(&dx) && (4..20).contains(&dy) {
                    (140 + (dx + dy) * 3) as u8
                } else {
                    230
                };
                bgr[idx..idx + 3].copy_from_slice(&[value, value, value]);
            }
        }
    }
    bgr
}

fn prepared(bgr: &[u8]) -> Mat {
    prepare_subframe(bgr, WIDTH, HEIGHT, 2, 1).expect("valid frame")
}

#[test]
fn moving_object_is_segmented_and_tracked() {
    let empty = prepared(&scene(None));
    let mut model = BackgroundModel::new(&empty, DEFAULT_DIFF_THRESHOLD).unwrap();
    model.learn(&empty, 0.1).unwrap();
    assert!(find_regions(&model.foreground(&empty).unwrap()).unwrap().is_empty());

    let first = prepared(&scene(Some((40, 40))));
    let mask = close(&model.foreground(&first).unwrap(), 1).unwrap();
    let regions = find_regions(&mask).unwrap();
    assert_eq!(regions.len(), 1);
    let bbox = regions[0].bbox;
    // 24px object at half scale, slightly widened by the blur.
    assert!((12..=14).contains(&bbox.width), "width {}", bbox.width);
    assert!(bbox.x.abs_diff(20) <= 1);

    let registry = TrackerRegistry::with_defaults();
    let backend = registry.default_backend().expect("built-in backend");
    let mut tracker = backend.init(&first, bbox).expect("tracker init");

    let mut last = bbox;
    for step in 1..=4 {
        let frame = prepared(&scene(Some((40 + step * 6, 40))));
        let next = tracker.update(&frame).expect("object stays tracked");
        assert!(next.x + 1 >= last.x, "step {step}: {next:?} after {last:?}");
        assert!(next.y.abs_diff(bbox.y) <= 2, "step {step}: {next:?}");
        last = next;
    }
    assert!(last.x.abs_diff(bbox.x + 12) <= 2, "ended at {last:?}");
}

#[test]
fn static_scene_change_is_absorbed_by_learning() {
    let empty = prepared(&scene(None));
    let mut model = BackgroundModel::new(&empty, DEFAULT_DIFF_THRESHOLD).unwrap();
    let parked = prepared(&scene(Some((100, 60))));
    assert!(!find_regions(&model.foreground(&parked).unwrap()).unwrap().is_empty());

    for _ in 0..60 {
        model.learn(&parked, 0.1).unwrap();
    }
    assert!(find_regions(&model.foreground(&parked).unwrap()).unwrap().is_empty());
}

#[test]
fn diagnostics_panels_convert_to_gray_images() {
    let first = prepared(&scene(Some((40, 40))));
    let edges = to_gray_image(&edge_map(&first, 60).unwrap()).unwrap();
    assert_eq!(edges.dimensions(), (WIDTH / 2, HEIGHT / 2));
    assert!(edges.pixels().any(|p| p[0] == 255));
    assert!(edges.get_pixel(2, 2)[0] == 0);
}

#[test]
fn unknown_backend_is_reported_by_name() {
    let registry = TrackerRegistry::with_defaults();
    let err = registry.get("SAD").err().expect("not registered");
    assert!(err.to_string().contains("SAD"));
    assert!(BoundingBox::new(0, 0, 0, 4).is_none());
}
