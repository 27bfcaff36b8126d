//! Loop closure on a square corridor trajectory with accumulated drift.
//!
//! The camera travels a 12 m square inside a walled corridor, drifting
//! sideways as it goes, then re-enters the first side. Re-observed wall
//! landmarks get fresh (drifted) duplicates, exactly like an uncorrected
//! run; the loop closer must detect the revisit, estimate the drift as a
//! similarity, fuse the duplicates and pull the trajectory back together.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{build_keyframe, check_map_invariants, test_camera, InstanceTable, MockVocabulary, SyntheticWorld};
use nalgebra::{Isometry3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};
use skein_types::Vocabulary;

const SIDE: f64 = 12.0;
const STEP: f64 = 2.0;

/// Position and heading along the square path, by perimeter arclength.
fn path(s: f64) -> (Point3<f64>, Vector3<f64>) {
    let s = s % (4.0 * SIDE);
    let (pos, dir) = if s < SIDE {
        (Point3::new(s, 0.0, 0.0), Vector3::x())
    } else if s < 2.0 * SIDE {
        (Point3::new(SIDE, 0.0, s - SIDE), Vector3::z())
    } else if s < 3.0 * SIDE {
        (Point3::new(3.0 * SIDE - s, 0.0, SIDE), -Vector3::x())
    } else {
        (Point3::new(0.0, 0.0, 4.0 * SIDE - s), -Vector3::z())
    };
    (pos, dir)
}

/// World→camera pose for a camera at `center` looking along `forward`
/// (horizontal), with the path plane horizontal.
fn looking(center: Point3<f64>, forward: Vector3<f64>) -> Isometry3<f64> {
    let z = forward.normalize();
    let y = Vector3::y();
    let x = y.cross(&z);
    let rot = Rotation3::from_matrix_unchecked(nalgebra::Matrix3::from_columns(&[x, y, z]));
    Isometry3::from_parts(
        Translation3::from(center.coords),
        UnitQuaternion::from_rotation_matrix(&rot),
    )
    .inverse()
}

/// Lateral drift of the front-end estimate at arclength `s`: zero on the
/// first side, then growing, frozen near the loop so the revisit segment is
/// self-consistent.
fn drift(s: f64) -> Vector3<f64> {
    Vector3::x() * (0.05 * (s - SIDE).clamp(0.0, 28.0))
}

/// A square corridor around the path: walls 2 m to either side, three rows
/// of landmarks on each wall.
fn corridor() -> SyntheticWorld {
    let mut points = Vec::new();
    let mut wall = |from: Point3<f64>, along: Vector3<f64>, len: f64| {
        let n = (len / 0.7) as usize;
        for i in 0..=n {
            for y in [-1.0, 0.0, 1.0] {
                let mut p = from + along * (i as f64 * 0.7);
                p.y = y;
                points.push(p);
            }
        }
    };
    let (lo, hi) = (-2.0, SIDE + 2.0);
    wall(Point3::new(lo, 0.0, lo), Vector3::x(), hi - lo);
    wall(Point3::new(lo, 0.0, hi), Vector3::x(), hi - lo);
    wall(Point3::new(lo, 0.0, lo), Vector3::z(), hi - lo);
    wall(Point3::new(hi, 0.0, lo), Vector3::z(), hi - lo);
    let (ilo, ihi) = (2.0, SIDE - 2.0);
    wall(Point3::new(ilo, 0.0, ilo), Vector3::x(), ihi - ilo);
    wall(Point3::new(ilo, 0.0, ihi), Vector3::x(), ihi - ilo);
    wall(Point3::new(ilo, 0.0, ilo), Vector3::z(), ihi - ilo);
    wall(Point3::new(ihi, 0.0, ilo), Vector3::z(), ihi - ilo);
    let mut world = SyntheticWorld::from_points(points);
    world.view_range = 10.0;
    world
}

#[test]
fn loop_closure_on_square_trajectory() {
    let camera = test_camera(400.0);
    let vocab: Arc<dyn Vocabulary> = Arc::new(MockVocabulary);
    let world = corridor();

    let map = skein::Map::new();
    let db = skein::KeyFrameDatabase::new(vocab.clone());
    let local_mapper = skein::LocalMapping::new(map.clone(), db.clone(), vocab.clone());
    let loop_closer = skein::LoopClosing::new(map.clone(), db.clone(), vocab.clone());
    local_mapper.set_loop_closer(loop_closer.clone());
    loop_closer.set_local_mapper(local_mapper.clone());

    // One lap plus a re-entry segment: 30 keyframes, 2 m apart.
    let mut table = InstanceTable::new(8);
    let mut keyframes = Vec::new();
    for k in 0..30u64 {
        let s = k as f64 * STEP;
        let (center, forward) = path(s);
        let true_pose = looking(center, forward);
        let offset = drift(s);
        let stored_pose = looking(center + offset, forward);

        let (mut frame, landmark_of) = world.render(k, &true_pose, &camera, 0.0, 17);
        frame.pose = Some(stored_pose);
        let kf = build_keyframe(&map, vocab.as_ref(), &frame, &landmark_of, &world, &mut table, k, offset);
        keyframes.push(kf);
    }
    // Sanity: the revisit created duplicate landmarks, and the drifted end
    // sits far from the start before any correction.
    assert!(map.points_in_map() > world.points.len() / 2);
    let gap_before = (keyframes[24].center() - keyframes[0].center()).norm();
    assert!(gap_before > 1.0, "drift before closing: {gap_before}");

    for kf in &keyframes {
        loop_closer.insert_keyframe(kf.clone());
    }
    loop_closer.process_pending();

    // A loop edge must exist between the re-entry segment and the first
    // side.
    let closed: Vec<_> = keyframes
        .iter()
        .filter(|kf| !kf.loop_edges().is_empty())
        .collect();
    assert!(!closed.is_empty(), "no loop was closed");
    assert!(closed.iter().any(|kf| kf.id.0 >= 24));
    assert!(closed.iter().any(|kf| kf.id.0 <= 5));

    // Let the detached global bundle adjustment finish and write back.
    let deadline = Instant::now() + Duration::from_secs(600);
    while loop_closer.is_running_global_ba() {
        assert!(Instant::now() < deadline, "global BA did not finish");
        std::thread::sleep(Duration::from_millis(10));
    }

    for kf in map.keyframes() {
        let pose = kf.pose();
        assert!(
            pose.translation.vector.iter().all(|v| v.is_finite())
                && pose.rotation.quaternion().coords.iter().all(|v| v.is_finite()),
            "non-finite pose on {}",
            kf.id
        );
    }

    // The re-entry keyframe shares its true position with the start; after
    // correction they must agree within 1% of the trajectory length.
    let trajectory_len = 30.0 * STEP;
    let gap_after = (keyframes[24].center() - keyframes[0].center()).norm();
    assert!(
        gap_after <= 0.01 * trajectory_len,
        "loop not closed: gap {gap_after} (was {gap_before})"
    );

    // Quiescent again: with no further input, a second pass over fresh
    // keyframes near the closed loop must not disturb the graph.
    let poses_after: Vec<Isometry3<f64>> = keyframes.iter().map(|kf| kf.pose()).collect();
    for k in 30..32u64 {
        let s = k as f64 * STEP;
        let (center, forward) = path(s);
        let (mut frame, landmark_of) = world.render(k, &looking(center, forward), &camera, 0.0, 17);
        frame.pose = Some(looking(center, forward));
        let kf = build_keyframe(&map, vocab.as_ref(), &frame, &landmark_of, &world, &mut table, k, Vector3::zeros());
        loop_closer.insert_keyframe(kf);
    }
    loop_closer.process_pending();
    for (kf, before) in keyframes.iter().zip(&poses_after) {
        assert_eq!(kf.pose(), *before, "{} moved without a new loop", kf.id);
    }

    check_map_invariants(&map);
    let _ = local_mapper;
}
