//! Non-linear refinement built on the external Levenberg-Marquardt solver.
//!
//! Every optimization is phrased as a [`levenberg_marquardt::LeastSquaresProblem`]:
//! a flat parameter vector, cached decoded state, residuals scaled by
//! per-octave σ and IRLS Huber weights, and analytic jacobians for the
//! reprojection problems (the Sim3 problems differentiate numerically, as
//! the original implementation's solver did for those edges).
//!
//! Cooperative cancellation: a problem holding an abort flag answers
//! `residuals() → None` once the flag is raised, which terminates the
//! minimization with a user termination reason. The caller then decides
//! whether the last consistent state is published.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{
    DVector, Dyn, Isometry3, Matrix2x3, OMatrix, OVector, Owned, Point2, Point3, Translation3,
    UnitQuaternion, Vector3, U6, U7,
};
use skein_mvg::{rotation_right_jacobian, skew_symmetric, Sim3};
use skein_types::{KeyFrameId, MapPointId};
use tracing::debug;

use crate::frame::Frame;
use crate::keyframe::KeyFrame;
use crate::map::Map;
use crate::map_point::MapPoint;

/// χ² gate (2 DoF, 95%) for monocular reprojection residuals.
pub const CHI2_MONO: f64 = 5.991;

fn huber_weight(residual_norm: f64, delta: f64) -> f64 {
    if residual_norm <= delta {
        1.0
    } else {
        delta / residual_norm
    }
}

/// d(projection)/d(camera-frame point).
fn proj_jacobian(fx: f64, fy: f64, pc: &Point3<f64>) -> Matrix2x3<f64> {
    let z = if pc.z.abs() < 1e-12 {
        1e-12f64.copysign(pc.z)
    } else {
        pc.z
    };
    let inv_z = 1.0 / z;
    let inv_z2 = inv_z * inv_z;
    Matrix2x3::new(
        fx * inv_z,
        0.0,
        -fx * pc.x * inv_z2,
        0.0,
        fy * inv_z,
        -fy * pc.y * inv_z2,
    )
}

fn project(fx: f64, fy: f64, cx: f64, cy: f64, pc: &Point3<f64>) -> Point2<f64> {
    let z = if pc.z.abs() < 1e-12 {
        1e-12f64.copysign(pc.z)
    } else {
        pc.z
    };
    Point2::new(fx * pc.x / z + cx, fy * pc.y / z + cy)
}

fn pose_from_params(v: &OVector<f64, U6>) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(v[3], v[4], v[5]),
        UnitQuaternion::from_scaled_axis(Vector3::new(v[0], v[1], v[2])),
    )
}

fn params_from_pose(pose: &Isometry3<f64>) -> OVector<f64, U6> {
    let rvec = pose.rotation.scaled_axis();
    let t = pose.translation.vector;
    OVector::<f64, U6>::from_column_slice(&[rvec.x, rvec.y, rvec.z, t.x, t.y, t.z])
}

// ---------------------------------------------------------------------------
// Pose-only optimization
// ---------------------------------------------------------------------------

struct PoseProblem {
    points: Vec<Point3<f64>>,
    observed: Vec<Point2<f64>>,
    inv_sigma: Vec<f64>,
    /// IRLS scale per edge; zero excludes the edge for this pass.
    weights: Vec<f64>,
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    params: OVector<f64, U6>,
    pose: Isometry3<f64>,
}

impl PoseProblem {
    fn chi2(&self, i: usize) -> f64 {
        let pc = self.pose * self.points[i];
        let d = self.observed[i] - project(self.fx, self.fy, self.cx, self.cy, &pc);
        let s = self.inv_sigma[i];
        if pc.z <= 0.0 {
            return f64::INFINITY;
        }
        (d.x * d.x + d.y * d.y) * s * s
    }
}

impl LeastSquaresProblem<f64, Dyn, U6> for PoseProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U6>;
    type ParameterStorage = Owned<f64, U6>;

    fn set_params(&mut self, x: &OVector<f64, U6>) {
        self.params = *x;
        self.pose = pose_from_params(x);
    }

    fn params(&self) -> OVector<f64, U6> {
        self.params
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut r = DVector::zeros(2 * self.points.len());
        for (i, pw) in self.points.iter().enumerate() {
            let scale = self.weights[i] * self.inv_sigma[i];
            if scale == 0.0 {
                continue;
            }
            let pc = self.pose * pw;
            let d = self.observed[i] - project(self.fx, self.fy, self.cx, self.cy, &pc);
            r[2 * i] = scale * d.x;
            r[2 * i + 1] = scale * d.y;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U6>> {
        let mut j = OMatrix::<f64, Dyn, U6>::zeros(2 * self.points.len());
        let rvec = Vector3::new(self.params[0], self.params[1], self.params[2]);
        let jr = rotation_right_jacobian(&rvec);
        let r = self.pose.rotation.to_rotation_matrix().into_inner();
        for (i, pw) in self.points.iter().enumerate() {
            let scale = self.weights[i] * self.inv_sigma[i];
            if scale == 0.0 {
                continue;
            }
            let pc = self.pose * pw;
            let jp = proj_jacobian(self.fx, self.fy, &pc);
            // residual = s(obs − proj(R p + t)):
            //   ∂/∂rvec = s·Jp·R·[p]ₓ·Jr,   ∂/∂t = −s·Jp
            let d_rot = scale * jp * r * skew_symmetric(&pw.coords) * jr;
            let d_t = -scale * jp;
            j.view_mut((2 * i, 0), (2, 3)).copy_from(&d_rot);
            j.view_mut((2 * i, 3), (2, 3)).copy_from(&d_t);
        }
        Some(j)
    }
}

/// Robust pose-only refinement of the current frame against its fixed 3D
/// associations. Four passes of bounded iterations; after each pass every
/// association is reclassified against the χ² gate, and the final pass runs
/// without the robust kernel. Returns the surviving inlier count and leaves
/// the outlier flags on the frame.
pub fn pose_optimization(frame: &mut Frame) -> usize {
    let Some(initial_pose) = frame.pose else {
        return 0;
    };
    let mut indices = Vec::new();
    let mut points = Vec::new();
    let mut observed = Vec::new();
    let mut inv_sigma = Vec::new();
    for (i, mp) in frame.matches.iter().enumerate() {
        let Some(mp) = mp else { continue };
        if mp.is_bad() {
            continue;
        }
        indices.push(i);
        points.push(mp.world_pos());
        observed.push(frame.keypoints[i].pt);
        inv_sigma.push(frame.pyramid.inv_sigma2[frame.keypoints[i].octave].sqrt());
        frame.outliers[i] = false;
    }
    let n = indices.len();
    if n < 3 {
        return 0;
    }

    let delta = CHI2_MONO.sqrt();
    let mut problem = PoseProblem {
        points,
        observed,
        inv_sigma,
        weights: vec![1.0; n],
        fx: frame.camera.fx(),
        fy: frame.camera.fy(),
        cx: frame.camera.cx(),
        cy: frame.camera.cy(),
        params: params_from_pose(&initial_pose),
        pose: initial_pose,
    };
    let mut outlier = vec![false; n];

    for pass in 0..4 {
        for i in 0..n {
            problem.weights[i] = if outlier[i] {
                0.0
            } else if pass < 3 {
                huber_weight(problem.chi2(i).sqrt(), delta)
            } else {
                1.0
            };
        }
        let params = problem.params;
        problem.set_params(&params);
        let (p, _report) = LevenbergMarquardt::new().with_patience(10).minimize(problem);
        problem = p;
        for i in 0..n {
            outlier[i] = problem.chi2(i) > CHI2_MONO;
        }
    }

    let mut inliers = 0;
    for (slot, &i) in indices.iter().enumerate() {
        frame.outliers[i] = outlier[slot];
        if !outlier[slot] {
            inliers += 1;
        }
    }
    frame.pose = Some(problem.pose);
    inliers
}

// ---------------------------------------------------------------------------
// Bundle adjustment (local and global)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum CamRef {
    Var(usize),
    Fixed(usize),
}

struct BaEdge {
    cam: CamRef,
    point: usize,
    observed: Point2<f64>,
    inv_sigma: f64,
    weight: f64,
}

struct BaProblem {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    n_cams: usize,
    edges: Vec<BaEdge>,
    fixed_poses: Vec<Isometry3<f64>>,
    params: DVector<f64>,
    cams: Vec<Isometry3<f64>>,
    points: Vec<Point3<f64>>,
    abort: Option<Arc<AtomicBool>>,
}

impl BaProblem {
    fn decode(&mut self) {
        self.cams = (0..self.n_cams)
            .map(|c| {
                let v = OVector::<f64, U6>::from_column_slice(&self.params.as_slice()[6 * c..6 * c + 6]);
                pose_from_params(&v)
            })
            .collect();
        let base = 6 * self.n_cams;
        self.points = (0..(self.params.len() - base) / 3)
            .map(|p| {
                Point3::new(
                    self.params[base + 3 * p],
                    self.params[base + 3 * p + 1],
                    self.params[base + 3 * p + 2],
                )
            })
            .collect();
    }

    fn cam_pose(&self, cam: CamRef) -> &Isometry3<f64> {
        match cam {
            CamRef::Var(c) => &self.cams[c],
            CamRef::Fixed(c) => &self.fixed_poses[c],
        }
    }

    fn edge_error(&self, e: &BaEdge) -> (f64, bool) {
        let pc = self.cam_pose(e.cam) * self.points[e.point];
        let d = e.observed - project(self.fx, self.fy, self.cx, self.cy, &pc);
        (
            (d.x * d.x + d.y * d.y) * e.inv_sigma * e.inv_sigma,
            pc.z > 0.0,
        )
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for BaProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params = x.clone();
        self.decode();
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        if let Some(abort) = &self.abort {
            if abort.load(Ordering::SeqCst) {
                return None;
            }
        }
        let mut r = DVector::zeros(2 * self.edges.len());
        for (i, e) in self.edges.iter().enumerate() {
            let scale = e.weight * e.inv_sigma;
            if scale == 0.0 {
                continue;
            }
            let pc = self.cam_pose(e.cam) * self.points[e.point];
            let d = e.observed - project(self.fx, self.fy, self.cx, self.cy, &pc);
            r[2 * i] = scale * d.x;
            r[2 * i + 1] = scale * d.y;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, Dyn>> {
        if let Some(abort) = &self.abort {
            if abort.load(Ordering::SeqCst) {
                return None;
            }
        }
        let base = 6 * self.n_cams;
        let mut j = OMatrix::<f64, Dyn, Dyn>::zeros(2 * self.edges.len(), self.params.len());
        for (i, e) in self.edges.iter().enumerate() {
            let scale = e.weight * e.inv_sigma;
            if scale == 0.0 {
                continue;
            }
            let pose = self.cam_pose(e.cam);
            let pw = &self.points[e.point];
            let pc = pose * pw;
            let jp = proj_jacobian(self.fx, self.fy, &pc);
            let rot = pose.rotation.to_rotation_matrix().into_inner();

            // point block
            let d_pt = -scale * jp * rot;
            j.view_mut((2 * i, base + 3 * e.point), (2, 3)).copy_from(&d_pt);

            // camera block
            if let CamRef::Var(c) = e.cam {
                let rvec = Vector3::new(
                    self.params[6 * c],
                    self.params[6 * c + 1],
                    self.params[6 * c + 2],
                );
                let jr = rotation_right_jacobian(&rvec);
                let d_rot = scale * jp * rot * skew_symmetric(&pw.coords) * jr;
                let d_t = -scale * jp;
                j.view_mut((2 * i, 6 * c), (2, 3)).copy_from(&d_rot);
                j.view_mut((2 * i, 6 * c + 3), (2, 3)).copy_from(&d_t);
            }
        }
        Some(j)
    }
}

struct BaSetup {
    problem: BaProblem,
    var_kfs: Vec<Arc<KeyFrame>>,
    points: Vec<Arc<MapPoint>>,
    /// (keyframe, point-slot) per edge, for outlier excision.
    edge_owners: Vec<(Arc<KeyFrame>, usize)>,
}

fn build_ba(
    var_kfs: Vec<Arc<KeyFrame>>,
    fixed_kfs: Vec<Arc<KeyFrame>>,
    points: Vec<Arc<MapPoint>>,
    map: &Map,
    abort: Option<Arc<AtomicBool>>,
) -> Option<BaSetup> {
    let first_cam = var_kfs.first()?.camera.clone();
    let var_slot: HashMap<KeyFrameId, usize> =
        var_kfs.iter().enumerate().map(|(i, kf)| (kf.id, i)).collect();
    let fixed_slot: HashMap<KeyFrameId, usize> =
        fixed_kfs.iter().enumerate().map(|(i, kf)| (kf.id, i)).collect();

    let mut params = Vec::with_capacity(6 * var_kfs.len() + 3 * points.len());
    for kf in &var_kfs {
        params.extend(params_from_pose(&kf.pose()).iter());
    }
    for mp in &points {
        params.extend(mp.world_pos().coords.iter());
    }

    let mut edges = Vec::new();
    let mut edge_owners = Vec::new();
    for (p_slot, mp) in points.iter().enumerate() {
        for (kf_id, idx) in mp.observations() {
            let cam = if let Some(&c) = var_slot.get(&kf_id) {
                CamRef::Var(c)
            } else if let Some(&c) = fixed_slot.get(&kf_id) {
                CamRef::Fixed(c)
            } else {
                continue;
            };
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            if kf.is_bad() {
                continue;
            }
            let kp = &kf.features.keypoints[idx];
            edges.push(BaEdge {
                cam,
                point: p_slot,
                observed: kp.pt,
                inv_sigma: kf.features.pyramid.inv_sigma2[kp.octave].sqrt(),
                weight: 1.0,
            });
            edge_owners.push((kf, idx));
        }
    }
    if edges.is_empty() {
        return None;
    }

    let mut problem = BaProblem {
        fx: first_cam.fx(),
        fy: first_cam.fy(),
        cx: first_cam.cx(),
        cy: first_cam.cy(),
        n_cams: var_kfs.len(),
        edges,
        fixed_poses: fixed_kfs.iter().map(|kf| kf.pose()).collect(),
        params: DVector::from_vec(params),
        cams: Vec::new(),
        points: Vec::new(),
        abort,
    };
    problem.decode();
    Some(BaSetup {
        problem,
        var_kfs,
        points,
        edge_owners,
    })
}

fn reweight(problem: &mut BaProblem, delta: Option<f64>) {
    let errors: Vec<(f64, bool)> = problem.edges.iter().map(|e| problem.edge_error(e)).collect();
    for (e, (chi2, in_front)) in problem.edges.iter_mut().zip(errors) {
        e.weight = if !in_front || chi2 > CHI2_MONO {
            0.0
        } else if let Some(delta) = delta {
            huber_weight(chi2.sqrt(), delta)
        } else {
            1.0
        };
    }
}

/// Local BA: the keyframe's covisible neighborhood as variables, every other
/// observer of the involved points as a fixed anchor. `abort` is polled
/// between solver iterations; an aborted pass is discarded and the last
/// consistent state is written back.
pub fn local_bundle_adjustment(kf: &Arc<KeyFrame>, abort: &Arc<AtomicBool>, map: &Map) {
    let mut var_kfs = vec![kf.clone()];
    let mut in_var: HashSet<KeyFrameId> = [kf.id].into();
    for id in kf.covisibles() {
        if let Some(neighbor) = map.keyframe(id) {
            if !neighbor.is_bad() && in_var.insert(id) {
                var_kfs.push(neighbor);
            }
        }
    }

    let mut points = Vec::new();
    let mut seen_points = HashSet::new();
    for kf in &var_kfs {
        for mp in kf.map_point_set() {
            if seen_points.insert(mp.id) {
                points.push(mp);
            }
        }
    }

    let mut fixed_kfs = Vec::new();
    let mut in_fixed = HashSet::new();
    for mp in &points {
        for kf_id in mp.observations().keys() {
            if !in_var.contains(kf_id) && in_fixed.insert(*kf_id) {
                if let Some(anchor) = map.keyframe(*kf_id) {
                    if !anchor.is_bad() {
                        fixed_kfs.push(anchor);
                    }
                }
            }
        }
    }

    let Some(mut setup) = build_ba(var_kfs, fixed_kfs, points, map, Some(abort.clone())) else {
        return;
    };
    let delta = CHI2_MONO.sqrt();

    reweight(&mut setup.problem, Some(delta));
    let params = setup.problem.params.clone();
    setup.problem.set_params(&params);
    let (p, report) = LevenbergMarquardt::new().with_patience(5).minimize(setup.problem);
    setup.problem = p;
    let mut last_good = setup.problem.params.clone();
    if !report.termination.was_successful() && abort.load(Ordering::SeqCst) {
        // Aborted mid-pass: nothing consistent to publish yet.
        return;
    }

    if !abort.load(Ordering::SeqCst) {
        reweight(&mut setup.problem, Some(delta));
        let params = setup.problem.params.clone();
        setup.problem.set_params(&params);
        let (p, report) = LevenbergMarquardt::new().with_patience(10).minimize(setup.problem);
        setup.problem = p;
        if report.termination.was_successful() || !abort.load(Ordering::SeqCst) {
            last_good = setup.problem.params.clone();
        }
    }
    setup.problem.set_params(&last_good.clone());

    // Classify outlier associations at the converged state.
    let mut to_erase: Vec<(Arc<KeyFrame>, Arc<MapPoint>, usize)> = Vec::new();
    for (i, e) in setup.problem.edges.iter().enumerate() {
        let (chi2, in_front) = setup.problem.edge_error(e);
        if chi2 > CHI2_MONO || !in_front {
            let (kf, idx) = &setup.edge_owners[i];
            to_erase.push((kf.clone(), setup.points[e.point].clone(), *idx));
        }
    }

    let _guard = map.lock_update();
    for (kf, mp, idx) in to_erase {
        kf.erase_match_at(idx);
        mp.erase_observation(kf.id, map);
    }
    for (c, kf) in setup.var_kfs.iter().enumerate() {
        kf.set_pose(setup.problem.cams[c]);
    }
    for (p, mp) in setup.points.iter().enumerate() {
        if !mp.is_bad() {
            mp.set_world_pos(setup.problem.points[p]);
            mp.update_normal_and_depth(map);
        }
    }
    debug!(kf = %kf.id, "local bundle adjustment applied");
}

/// Full-map BA. Returns the refined poses and positions without touching the
/// map; the caller owns the write-back (and its locking). `None` when the
/// stop flag cancelled the run.
#[allow(clippy::type_complexity)]
pub fn global_bundle_adjustment(
    map: &Map,
    iterations: usize,
    fixed_kf: Option<KeyFrameId>,
    stop: Option<Arc<AtomicBool>>,
) -> Option<(
    HashMap<KeyFrameId, Isometry3<f64>>,
    HashMap<MapPointId, Point3<f64>>,
)> {
    let fixed_id = fixed_kf.or_else(|| map.origin())?;
    let mut var_kfs = Vec::new();
    let mut fixed_kfs = Vec::new();
    for kf in map.keyframes() {
        if kf.is_bad() {
            continue;
        }
        if kf.id == fixed_id {
            fixed_kfs.push(kf);
        } else {
            var_kfs.push(kf);
        }
    }
    let points: Vec<Arc<MapPoint>> = map.points().into_iter().filter(|mp| !mp.is_bad()).collect();

    let mut setup = build_ba(var_kfs, fixed_kfs, points, map, stop.clone())?;
    reweight(&mut setup.problem, Some(CHI2_MONO.sqrt()));
    let params = setup.problem.params.clone();
    setup.problem.set_params(&params);
    let (p, _report) = LevenbergMarquardt::new()
        .with_patience(iterations)
        .minimize(setup.problem);
    setup.problem = p;

    if let Some(stop) = &stop {
        if stop.load(Ordering::SeqCst) {
            return None;
        }
    }

    let mut kf_poses = HashMap::new();
    for (c, kf) in setup.var_kfs.iter().enumerate() {
        kf_poses.insert(kf.id, setup.problem.cams[c]);
    }
    let mut positions = HashMap::new();
    for (p, mp) in setup.points.iter().enumerate() {
        positions.insert(mp.id, setup.problem.points[p]);
    }
    Some((kf_poses, positions))
}

// ---------------------------------------------------------------------------
// Sim3 optimization
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Sim3Edge {
    pc1: Point3<f64>,
    pc2: Point3<f64>,
    obs1: Point2<f64>,
    obs2: Point2<f64>,
    inv_sigma1: f64,
    inv_sigma2: f64,
    weight: f64,
}

#[derive(Clone)]
struct Sim3Problem {
    edges: Vec<Sim3Edge>,
    cam1: (f64, f64, f64, f64),
    cam2: (f64, f64, f64, f64),
    fix_scale: bool,
    params: OVector<f64, U7>,
    s12: Sim3,
}

impl Sim3Problem {
    /// (forward, backward) χ² of one edge.
    fn chi2(&self, e: &Sim3Edge) -> (f64, f64) {
        let (fx1, fy1, cx1, cy1) = self.cam1;
        let (fx2, fy2, cx2, cy2) = self.cam2;
        let p1 = self.s12.transform(&e.pc2);
        let d1 = e.obs1 - project(fx1, fy1, cx1, cy1, &p1);
        let p2 = self.s12.inverse().transform(&e.pc1);
        let d2 = e.obs2 - project(fx2, fy2, cx2, cy2, &p2);
        (
            (d1.x * d1.x + d1.y * d1.y) * e.inv_sigma1 * e.inv_sigma1,
            (d2.x * d2.x + d2.y * d2.y) * e.inv_sigma2 * e.inv_sigma2,
        )
    }
}

impl LeastSquaresProblem<f64, Dyn, U7> for Sim3Problem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U7>;
    type ParameterStorage = Owned<f64, U7>;

    fn set_params(&mut self, x: &OVector<f64, U7>) {
        self.params = *x;
        if self.fix_scale {
            self.params[6] = 0.0;
        }
        self.s12 = Sim3::exp(&self.params);
    }

    fn params(&self) -> OVector<f64, U7> {
        self.params
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let (fx1, fy1, cx1, cy1) = self.cam1;
        let (fx2, fy2, cx2, cy2) = self.cam2;
        let s21 = self.s12.inverse();
        let mut r = DVector::zeros(4 * self.edges.len());
        for (i, e) in self.edges.iter().enumerate() {
            if e.weight == 0.0 {
                continue;
            }
            let p1 = self.s12.transform(&e.pc2);
            let d1 = e.obs1 - project(fx1, fy1, cx1, cy1, &p1);
            r[4 * i] = e.weight * e.inv_sigma1 * d1.x;
            r[4 * i + 1] = e.weight * e.inv_sigma1 * d1.y;
            let p2 = s21.transform(&e.pc1);
            let d2 = e.obs2 - project(fx2, fy2, cx2, cy2, &p2);
            r[4 * i + 2] = e.weight * e.inv_sigma2 * d2.x;
            r[4 * i + 3] = e.weight * e.inv_sigma2 * d2.y;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U7>> {
        // Central differences over the 7 chart parameters; the edge count is
        // small and the bidirectional projection makes the analytic form
        // disproportionately fiddly.
        let h = 1e-6;
        let base = self.params;
        let mut j = OMatrix::<f64, Dyn, U7>::zeros(4 * self.edges.len());
        let mut probe = self.clone();
        for k in 0..7 {
            if self.fix_scale && k == 6 {
                continue;
            }
            let mut plus = base;
            plus[k] += h;
            probe.set_params(&plus);
            let rp = probe.residuals()?;
            let mut minus = base;
            minus[k] -= h;
            probe.set_params(&minus);
            let rm = probe.residuals()?;
            let col = (rp - rm) / (2.0 * h);
            j.column_mut(k).copy_from(&col);
        }
        Some(j)
    }
}

/// Refine a candidate similarity between two keyframes from their shared
/// landmark matches (bidirectional robust reprojection, 7 DoF when the
/// scale is free). Prunes matches whose residual exceeds `th2`, and returns
/// the inlier count with the refined transform.
pub fn optimize_sim3(
    kf1: &Arc<KeyFrame>,
    kf2: &Arc<KeyFrame>,
    matches12: &mut [Option<Arc<MapPoint>>],
    s12: Sim3,
    th2: f64,
    fix_scale: bool,
) -> (usize, Option<Sim3>) {
    let t_1w = kf1.pose();
    let t_2w = kf2.pose();
    let points1 = kf1.map_points();

    let mut edges = Vec::new();
    let mut edge_idx = Vec::new();
    for (i1, mp2) in matches12.iter().enumerate() {
        let Some(mp2) = mp2 else { continue };
        let Some(mp1) = &points1[i1] else { continue };
        if mp1.is_bad() || mp2.is_bad() {
            continue;
        }
        let Some(i2) = mp2.index_in(kf2.id) else {
            continue;
        };
        let kp1 = &kf1.features.keypoints[i1];
        let kp2 = &kf2.features.keypoints[i2];
        edges.push(Sim3Edge {
            pc1: t_1w * mp1.world_pos(),
            pc2: t_2w * mp2.world_pos(),
            obs1: kp1.pt,
            obs2: kp2.pt,
            inv_sigma1: kf1.features.pyramid.inv_sigma2[kp1.octave].sqrt(),
            inv_sigma2: kf2.features.pyramid.inv_sigma2[kp2.octave].sqrt(),
            weight: 1.0,
        });
        edge_idx.push(i1);
    }
    if edges.len() < 6 {
        return (0, None);
    }

    let cam1 = (
        kf1.camera.fx(),
        kf1.camera.fy(),
        kf1.camera.cx(),
        kf1.camera.cy(),
    );
    let cam2 = (
        kf2.camera.fx(),
        kf2.camera.fy(),
        kf2.camera.cx(),
        kf2.camera.cy(),
    );
    let mut problem = Sim3Problem {
        edges,
        cam1,
        cam2,
        fix_scale,
        params: s12.log(),
        s12,
    };

    let (p, _report) = LevenbergMarquardt::new().with_patience(10).minimize(problem);
    problem = p;

    // Drop outliers and re-optimize once.
    let chi2s: Vec<(f64, f64)> = problem.edges.iter().map(|e| problem.chi2(e)).collect();
    let mut n_bad = 0;
    for (slot, (c1, c2)) in chi2s.into_iter().enumerate() {
        if c1 > th2 || c2 > th2 {
            problem.edges[slot].weight = 0.0;
            matches12[edge_idx[slot]] = None;
            n_bad += 1;
        }
    }
    if problem.edges.len() - n_bad < 10 {
        return (0, None);
    }

    let (p, _report) = LevenbergMarquardt::new().with_patience(10).minimize(problem);
    problem = p;

    let mut inliers = 0;
    for e in &problem.edges {
        if e.weight == 0.0 {
            continue;
        }
        let (c1, c2) = problem.chi2(e);
        if c1 <= th2 && c2 <= th2 {
            inliers += 1;
        }
    }
    (inliers, Some(problem.s12))
}

// ---------------------------------------------------------------------------
// Essential-graph optimization
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum VertexRef {
    Var(usize),
    Fixed,
}

struct EssentialProblem {
    params: DVector<f64>,
    vertices: Vec<Sim3>,
    fixed: Sim3,
    edges: Vec<(VertexRef, VertexRef, Sim3)>,
}

impl EssentialProblem {
    fn decode(&mut self) {
        self.vertices = (0..self.params.len() / 7)
            .map(|v| {
                Sim3::exp(&OVector::<f64, U7>::from_column_slice(
                    &self.params.as_slice()[7 * v..7 * v + 7],
                ))
            })
            .collect();
    }

    fn vertex(&self, v: VertexRef) -> Sim3 {
        match v {
            VertexRef::Var(slot) => self.vertices[slot],
            VertexRef::Fixed => self.fixed,
        }
    }

    fn edge_residual(&self, i: VertexRef, j: VertexRef, meas: &Sim3) -> OVector<f64, U7> {
        (*meas * self.vertex(i) * self.vertex(j).inverse()).log()
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for EssentialProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params = x.clone();
        self.decode();
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut r = DVector::zeros(7 * self.edges.len());
        for (e, (i, j, meas)) in self.edges.iter().enumerate() {
            let res = self.edge_residual(*i, *j, meas);
            r.rows_mut(7 * e, 7).copy_from(&res);
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, Dyn>> {
        // Per-edge numeric differentiation; only the two endpoint blocks of
        // each edge are non-zero, exactly like the pose-graph edges of the
        // original solver.
        let h = 1e-7;
        let mut j = OMatrix::<f64, Dyn, Dyn>::zeros(7 * self.edges.len(), self.params.len());
        for (e, (vi, vj, meas)) in self.edges.iter().enumerate() {
            for (vref, other, first) in [(vi, vj, true), (vj, vi, false)] {
                let VertexRef::Var(slot) = *vref else {
                    continue;
                };
                for k in 0..7 {
                    let orig = self.params[7 * slot + k];
                    let mut block = OVector::<f64, U7>::from_column_slice(
                        &self.params.as_slice()[7 * slot..7 * slot + 7],
                    );
                    block[k] = orig + h;
                    let plus = Sim3::exp(&block);
                    block[k] = orig - h;
                    let minus = Sim3::exp(&block);
                    let (rp, rm) = if first {
                        (
                            (*meas * plus * self.vertex(*other).inverse()).log(),
                            (*meas * minus * self.vertex(*other).inverse()).log(),
                        )
                    } else {
                        (
                            (*meas * self.vertex(*other) * plus.inverse()).log(),
                            (*meas * self.vertex(*other) * minus.inverse()).log(),
                        )
                    };
                    let col = (rp - rm) / (2.0 * h);
                    j.view_mut((7 * e, 7 * slot + k), (7, 1)).copy_from(&col);
                }
            }
        }
        Some(j)
    }
}

/// Covisibility weight floor for edges entering the essential graph.
pub const ESSENTIAL_WEIGHT_TH: usize = 100;

/// Pose-graph optimization over the essential graph: spanning tree, old and
/// new loop edges, and strong covisibility edges, with 7-DoF Sim3 vertices.
/// The loop partner is fixed; measurements mix pre- and post-correction
/// relative transforms so the accumulated drift is distributed along the
/// graph. Updates every keyframe pose and every landmark position.
pub fn optimize_essential_graph(
    map: &Map,
    loop_kf: &Arc<KeyFrame>,
    current_kf: &Arc<KeyFrame>,
    non_corrected: &HashMap<KeyFrameId, Sim3>,
    corrected: &HashMap<KeyFrameId, Sim3>,
    loop_connections: &HashMap<KeyFrameId, HashSet<KeyFrameId>>,
    point_anchors: &HashMap<MapPointId, KeyFrameId>,
) {
    let keyframes: Vec<Arc<KeyFrame>> = map
        .keyframes()
        .into_iter()
        .filter(|kf| !kf.is_bad())
        .collect();

    // Initial estimates: corrected Sim3 where available, current pose
    // elsewhere.
    let mut initial: HashMap<KeyFrameId, Sim3> = HashMap::new();
    for kf in &keyframes {
        let siw = corrected
            .get(&kf.id)
            .copied()
            .unwrap_or_else(|| Sim3::from_isometry(&kf.pose()));
        initial.insert(kf.id, siw);
    }
    let measured = |id: KeyFrameId| -> Sim3 {
        non_corrected
            .get(&id)
            .copied()
            .unwrap_or_else(|| {
                map.keyframe(id)
                    .map(|kf| Sim3::from_isometry(&kf.pose()))
                    .unwrap_or_else(Sim3::identity)
            })
    };

    let mut var_ids: Vec<KeyFrameId> = Vec::new();
    let mut slot_of: HashMap<KeyFrameId, VertexRef> = HashMap::new();
    for kf in &keyframes {
        if kf.id == loop_kf.id {
            slot_of.insert(kf.id, VertexRef::Fixed);
        } else {
            slot_of.insert(kf.id, VertexRef::Var(var_ids.len()));
            var_ids.push(kf.id);
        }
    }

    let mut params = Vec::with_capacity(7 * var_ids.len());
    for id in &var_ids {
        params.extend(initial[id].log().iter());
    }

    let mut edges: Vec<(VertexRef, VertexRef, Sim3)> = Vec::new();
    let mut inserted: HashSet<(KeyFrameId, KeyFrameId)> = HashSet::new();
    let mut insert_edge = |edges: &mut Vec<(VertexRef, VertexRef, Sim3)>,
                           inserted: &mut HashSet<(KeyFrameId, KeyFrameId)>,
                           i: KeyFrameId,
                           j: KeyFrameId,
                           meas: Sim3|
     -> bool {
        let key = (i.min(j), i.max(j));
        if !inserted.insert(key) {
            return false;
        }
        edges.push((slot_of[&i], slot_of[&j], meas));
        true
    };

    // New loop connections, measured with the already-corrected estimates.
    for (&kf_i, neighbors) in loop_connections {
        let Some(s_iw) = initial.get(&kf_i).copied() else {
            continue;
        };
        let Some(kf_i_arc) = map.keyframe(kf_i) else {
            continue;
        };
        for &kf_j in neighbors {
            if !slot_of.contains_key(&kf_j) {
                continue;
            }
            let is_main_loop = (kf_i == current_kf.id && kf_j == loop_kf.id)
                || (kf_j == current_kf.id && kf_i == loop_kf.id);
            if !is_main_loop && kf_i_arc.weight(kf_j) < ESSENTIAL_WEIGHT_TH {
                continue;
            }
            let s_jw = initial[&kf_j];
            let s_ji = s_jw * s_iw.inverse();
            insert_edge(&mut edges, &mut inserted, kf_i, kf_j, s_ji);
        }
    }

    // Spanning tree, pre-existing loop edges, and strong covisibility,
    // measured with the uncorrected relative transforms.
    for kf in &keyframes {
        let s_iw = measured(kf.id);
        let s_wi = s_iw.inverse();

        if let Some(parent) = kf.parent() {
            if slot_of.contains_key(&parent) {
                let s_ji = measured(parent) * s_wi;
                insert_edge(&mut edges, &mut inserted, kf.id, parent, s_ji);
            }
        }
        for loop_edge in kf.loop_edges() {
            if loop_edge < kf.id && slot_of.contains_key(&loop_edge) {
                let s_li = measured(loop_edge) * s_wi;
                insert_edge(&mut edges, &mut inserted, kf.id, loop_edge, s_li);
            }
        }
        let parent = kf.parent();
        let children: HashSet<KeyFrameId> = kf.children().into_iter().collect();
        for neighbor in kf.covisibles_by_weight(ESSENTIAL_WEIGHT_TH) {
            if neighbor >= kf.id
                || Some(neighbor) == parent
                || children.contains(&neighbor)
                || !slot_of.contains_key(&neighbor)
            {
                continue;
            }
            let s_ji = measured(neighbor) * s_wi;
            insert_edge(&mut edges, &mut inserted, kf.id, neighbor, s_ji);
        }
    }

    let mut problem = EssentialProblem {
        params: DVector::from_vec(params),
        vertices: Vec::new(),
        fixed: initial[&loop_kf.id],
        edges,
    };
    problem.decode();

    let (p, report) = LevenbergMarquardt::new().with_patience(20).minimize(problem);
    problem = p;
    debug!(
        objective = report.objective_function,
        "essential graph optimized"
    );

    // Recover: keyframe poses from their optimized Sim3, landmark positions
    // through their anchor keyframe's pre/post transforms.
    let _guard = map.lock_update();
    let mut optimized: HashMap<KeyFrameId, Sim3> = HashMap::new();
    optimized.insert(loop_kf.id, problem.fixed);
    for (slot, id) in var_ids.iter().enumerate() {
        optimized.insert(*id, problem.vertices[slot]);
    }
    for kf in &keyframes {
        let s_iw = optimized[&kf.id];
        kf.set_pose(s_iw.to_isometry_rescaled());
    }
    for mp in map.points() {
        if mp.is_bad() {
            continue;
        }
        let anchor = point_anchors
            .get(&mp.id)
            .copied()
            .unwrap_or_else(|| mp.reference_keyframe());
        let (Some(before), Some(after)) = (initial.get(&anchor), optimized.get(&anchor)) else {
            continue;
        };
        let pos = mp.world_pos();
        let corrected_pos = after.inverse().transform(&before.transform(&pos));
        mp.set_world_pos(corrected_pos);
        mp.update_normal_and_depth(map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn synthetic_pose_problem(pose: Isometry3<f64>) -> PoseProblem {
        let truth = Isometry3::from_parts(
            Translation3::new(0.1, -0.05, 0.2),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.02, 0.1, -0.03)),
        );
        let mut points = Vec::new();
        let mut observed = Vec::new();
        for i in 0..30 {
            let pw = Point3::new(
                (i % 5) as f64 - 2.0,
                (i / 5) as f64 - 2.5,
                4.0 + (i % 3) as f64,
            );
            let pc = truth * pw;
            points.push(pw);
            observed.push(Point2::new(
                500.0 * pc.x / pc.z + 320.0,
                500.0 * pc.y / pc.z + 240.0,
            ));
        }
        let n = points.len();
        PoseProblem {
            points,
            observed,
            inv_sigma: vec![1.0; n],
            weights: vec![1.0; n],
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
            params: params_from_pose(&pose),
            pose,
        }
    }

    #[test]
    fn pose_jacobian_matches_numeric() {
        let pose = Isometry3::from_parts(
            Translation3::new(0.12, -0.07, 0.18),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.04, 0.08, -0.01)),
        );
        let mut problem = synthetic_pose_problem(pose);
        let jacobian_numerical = levenberg_marquardt::differentiate_numerically(&mut problem).unwrap();
        let jacobian_trait = problem.jacobian().unwrap();
        assert_relative_eq!(jacobian_numerical, jacobian_trait, epsilon = 1e-5);
    }

    #[test]
    fn pose_problem_converges_to_truth() {
        let start = Isometry3::from_parts(
            Translation3::new(0.0, 0.0, 0.0),
            UnitQuaternion::identity(),
        );
        let problem = synthetic_pose_problem(start);
        let (solved, report) = LevenbergMarquardt::new().minimize(problem);
        assert!(report.termination.was_successful());
        assert!(report.objective_function < 1e-10);
        assert_relative_eq!(solved.pose.translation.vector.x, 0.1, epsilon = 1e-6);
    }

    #[test]
    fn pose_optimization_flags_gross_correspondences() {
        use crate::frame::Frame;
        use crate::map_point::MapPoint;
        use skein_mvg::PinholeCamera;
        use skein_types::{
            Descriptor, Extraction, FrameId, KeyFrameId, KeyPoint, MapPointId, ScalePyramid,
        };

        let camera = Arc::new(
            PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0, [0.0; 5]).unwrap(),
        );
        let truth = Isometry3::translation(0.05, -0.02, 0.1);

        let mut keypoints = Vec::new();
        let mut world = Vec::new();
        for i in 0..40 {
            let pw = Point3::new(
                (i % 8) as f64 * 0.5 - 2.0,
                (i / 8) as f64 * 0.5 - 1.0,
                5.0 + (i % 3) as f64,
            );
            let px = camera.project_world(&truth, &pw).unwrap();
            keypoints.push(KeyPoint {
                pt: px,
                octave: 0,
                angle: 0.0,
            });
            world.push(pw);
        }
        // One gross mismatch: the observation points 40 px away from where
        // its landmark projects.
        keypoints[7].pt.x += 40.0;

        let extraction = Extraction {
            keypoints,
            descriptors: vec![Descriptor([0; 32]); 40],
            pyramid: ScalePyramid::new(8, 1.2),
        };
        let mut frame = Frame::new(FrameId(0), 0.0, extraction, camera);
        for (i, pw) in world.iter().enumerate() {
            frame.matches[i] = Some(Arc::new(MapPoint::new(
                MapPointId(i as u64),
                *pw,
                KeyFrameId(0),
                Descriptor([0; 32]),
            )));
        }
        frame.pose = Some(Isometry3::identity());

        let inliers = pose_optimization(&mut frame);
        assert_eq!(inliers, 39);
        assert!(frame.outliers[7], "the corrupted correspondence is an outlier");
        let pose = frame.pose.unwrap();
        assert_relative_eq!(
            pose.translation.vector,
            truth.translation.vector,
            epsilon = 1e-6
        );
    }

    #[test]
    fn sim3_numeric_jacobian_is_finite() {
        let s = Sim3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.1, 0.0, 0.0)),
            Vector3::new(0.2, 0.0, 0.1),
            1.1,
        );
        let edges = vec![Sim3Edge {
            pc1: Point3::new(0.1, 0.2, 3.0),
            pc2: Point3::new(-0.1, 0.15, 2.8),
            obs1: Point2::new(320.0, 240.0),
            obs2: Point2::new(322.0, 239.0),
            inv_sigma1: 1.0,
            inv_sigma2: 1.0,
            weight: 1.0,
        }];
        let problem = Sim3Problem {
            edges,
            cam1: (500.0, 500.0, 320.0, 240.0),
            cam2: (500.0, 500.0, 320.0, 240.0),
            fix_scale: false,
            params: s.log(),
            s12: s,
        };
        let j = problem.jacobian().unwrap();
        assert!(j.iter().all(|v| v.is_finite()));
        assert!(j.column(6).norm() > 0.0, "scale column must be live");
    }

    #[test]
    fn essential_residual_zero_at_consistent_estimates() {
        let s_i = Sim3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.1, 0.0)),
            Vector3::new(1.0, 0.0, 0.0),
            1.0,
        );
        let s_j = Sim3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.2, 0.0)),
            Vector3::new(2.0, 0.0, 0.0),
            1.0,
        );
        let meas = s_j * s_i.inverse();
        let err_sim = meas * s_i * s_j.inverse();
        assert!(err_sim.log().norm() < 1e-12);
        let problem = EssentialProblem {
            params: DVector::from_vec(s_i.log().iter().cloned().collect()),
            vertices: vec![s_i],
            fixed: s_j,
            edges: vec![(VertexRef::Var(0), VertexRef::Fixed, meas)],
        };
        let r = problem.residuals().unwrap();
        assert!(r.norm() < 1e-12);
    }
}
