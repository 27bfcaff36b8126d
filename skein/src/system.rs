//! The engine facade: owns the map, the database and the three pipelines,
//! spawns the worker threads, and exposes the control surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nalgebra::Isometry3;
use parking_lot::Mutex;
use skein_mvg::PinholeCamera;
use skein_types::{FeatureExtractor, GrayImage, SlamConfig, Vocabulary};
use tracing::info;

use crate::error::{Error, Result};
use crate::keyframe_database::KeyFrameDatabase;
use crate::local_mapping::LocalMapping;
use crate::loop_closing::LoopClosing;
use crate::map::Map;
use crate::tracking::{Tracking, TrackingState};

pub struct System {
    map: Arc<Map>,
    db: Arc<KeyFrameDatabase>,
    tracking: Mutex<Tracking>,
    local_mapper: Arc<LocalMapping>,
    loop_closer: Arc<LoopClosing>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    activate_localization: AtomicBool,
    deactivate_localization: AtomicBool,
}

impl System {
    /// Validate the configuration and collaborators, build the shared state
    /// and spawn the local-mapping and loop-closing threads. All failures
    /// here are fatal; nothing is spawned on error.
    pub fn new(
        config: &SlamConfig,
        vocab: Arc<dyn Vocabulary>,
        extractor: Arc<dyn FeatureExtractor>,
    ) -> Result<System> {
        config.validate()?;
        if vocab.size() == 0 {
            return Err(Error::Vocabulary {
                reason: "vocabulary has no words",
            });
        }
        let cam = &config.camera;
        let camera = Arc::new(PinholeCamera::new(
            cam.width,
            cam.height,
            cam.fx,
            cam.fy,
            cam.cx,
            cam.cy,
            cam.distortion_vec(),
        )?);

        let map = Map::new();
        let db = KeyFrameDatabase::new(vocab.clone());
        let local_mapper = LocalMapping::new(map.clone(), db.clone(), vocab.clone());
        let loop_closer = LoopClosing::new(map.clone(), db.clone(), vocab.clone());
        local_mapper.set_loop_closer(loop_closer.clone());
        loop_closer.set_local_mapper(local_mapper.clone());

        let mut tracking = Tracking::new(
            config,
            camera,
            vocab,
            extractor,
            map.clone(),
            db.clone(),
            local_mapper.clone(),
        );
        tracking.set_loop_closer(loop_closer.clone());

        let mut threads = Vec::new();
        {
            let local_mapper = local_mapper.clone();
            threads.push(std::thread::spawn(move || local_mapper.run()));
        }
        {
            let loop_closer = loop_closer.clone();
            threads.push(std::thread::spawn(move || loop_closer.run()));
        }
        info!("system started");

        Ok(System {
            map,
            db,
            tracking: Mutex::new(tracking),
            local_mapper,
            loop_closer,
            threads: Mutex::new(threads),
            activate_localization: AtomicBool::new(false),
            deactivate_localization: AtomicBool::new(false),
        })
    }

    /// Feed one grayscale frame; returns the world→camera pose when tracked.
    pub fn track_monocular(&self, image: &GrayImage<'_>, timestamp: f64) -> Option<Isometry3<f64>> {
        if self.activate_localization.swap(false, Ordering::SeqCst) {
            self.local_mapper.request_stop();
            while !self.local_mapper.is_stopped() && !self.local_mapper.is_finished() {
                std::thread::sleep(Duration::from_millis(1));
            }
            self.tracking.lock().set_only_tracking(true);
            info!("localization mode active");
        }
        if self.deactivate_localization.swap(false, Ordering::SeqCst) {
            self.tracking.lock().set_only_tracking(false);
            self.local_mapper.release();
            info!("localization mode deactivated");
        }
        self.tracking.lock().track_image(image, timestamp)
    }

    /// Pause map growth: local mapping stops, tracking keeps localizing
    /// against the frozen map. Idempotent.
    pub fn activate_localization_mode(&self) {
        self.activate_localization.store(true, Ordering::SeqCst);
    }

    pub fn deactivate_localization_mode(&self) {
        self.deactivate_localization.store(true, Ordering::SeqCst);
    }

    /// Clear the map and all worker state; takes effect before the next
    /// frame is processed.
    pub fn reset(&self) {
        self.tracking.lock().request_reset();
    }

    /// Request finish on both workers and join them.
    pub fn shutdown(&self) {
        self.local_mapper.request_finish();
        self.loop_closer.request_finish();
        while !self.local_mapper.is_finished() || !self.loop_closer.is_finished() {
            std::thread::sleep(Duration::from_millis(3));
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        info!("system shut down");
    }

    pub fn tracking_state(&self) -> TrackingState {
        self.tracking.lock().state()
    }

    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    pub fn keyframe_database(&self) -> &Arc<KeyFrameDatabase> {
        &self.db
    }
}
