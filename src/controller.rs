//! Per-session application logic: handshake, focus tracking, the motion
//! processing pipeline, and button actions. Grounded on
//! `examples/original_source/main.py`'s `Controller` class (`process_motion`,
//! `process_button`, the `"create"`/`"update"`/`"config.*"` dispatch in
//! `handle_websocket`) as the fuller single-process reference, restructured
//! per the WAMP codec/session split already in `wamp.rs`/`session.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use crate::config::{ButtonAction, Config, ConfigHandle};
use crate::device::{ButtonSample, MotionSample};
use crate::keyboard::VirtualKeyboard;
use crate::motion::{self, Affine, MotionInput};
use crate::session::Session;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Per-session application state layered on top of the WAMP `Session`. Lives
/// from session creation (with placeholder metadata) until teardown.
pub struct Controller {
    session: Session,
    config: ConfigHandle,
    keyboard: std::sync::Arc<dyn VirtualKeyboard>,
    client_metadata: Mutex<Value>,
    focus: AtomicBool,
    horizon_locked: AtomicBool,
    pending_spin: Mutex<f64>,
    motion_busy: AtomicBool,
}

impl Controller {
    pub fn new(session: Session, config: ConfigHandle, keyboard: std::sync::Arc<dyn VirtualKeyboard>) -> Self {
        Self {
            session,
            config,
            keyboard,
            client_metadata: Mutex::new(Value::Null),
            focus: AtomicBool::new(false),
            horizon_locked: AtomicBool::new(false),
            pending_spin: Mutex::new(0.0),
            motion_busy: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn focus(&self) -> bool {
        self.focus.load(Ordering::Relaxed)
    }

    /// Dispatches a resolved inbound CALL by substring match against the
    /// handler table in spec §4.5. The two `create` calls are distinguished
    /// by their first argument; everything else not recognized returns null,
    /// matching the source's `else: ... CALLRESULT call_id None` fallback.
    pub async fn handle_call(&self, proc_uri: &str, args: Vec<Value>) -> Result<Value, (String, String)> {
        if proc_uri.contains("create") {
            return self.handle_create(&args);
        }
        if proc_uri.contains("update") {
            return Ok(self.handle_update(&args));
        }
        if proc_uri.contains("config.get") {
            let snapshot = self.config.snapshot().await;
            return Ok(serde_json::to_value(&*snapshot).unwrap_or(Value::Null));
        }
        if proc_uri.contains("config.set") {
            return self.handle_config_set(args).await;
        }
        Ok(Value::Null)
    }

    fn handle_create(&self, args: &[Value]) -> Result<Value, (String, String)> {
        let first = args.first().and_then(Value::as_str).unwrap_or("");
        if first.contains("3dmouse") {
            return Ok(serde_json::json!({ "connexion": "mouse0" }));
        }
        if first.contains("3dcontroller") {
            let metadata = args.get(2).cloned().unwrap_or(Value::Null);
            *lock(&self.client_metadata) = metadata;
            return Ok(serde_json::json!({ "instance": "controller0" }));
        }
        Ok(Value::Null)
    }

    /// `args` is `[uri, props]`; sets focus when `props.focus` is present.
    fn handle_update(&self, args: &[Value]) -> Value {
        if let Some(props) = args.get(1) {
            if let Some(focus) = props.get("focus").and_then(Value::as_bool) {
                self.focus.store(focus, Ordering::Relaxed);
                tracing::info!(focus, "client focus changed");
            }
        }
        Value::Null
    }

    async fn handle_config_set(&self, args: Vec<Value>) -> Result<Value, (String, String)> {
        let new_config: Config = match args.into_iter().next() {
            Some(value) => serde_json::from_value(value)
                .map_err(|err| ("config.set".to_owned(), format!("invalid config: {err}")))?,
            None => return Err(("config.set".to_owned(), "missing config argument".into())),
        };
        match self.config.set(new_config).await {
            Ok(()) => Ok(Value::from("OK")),
            Err(err) => Err(("config.set".to_owned(), err.to_string())),
        }
    }

    /// Runs the motion pipeline (spec §4.5 steps 1-4 and 12; steps 5-11
    /// delegate to `motion::apply_motion`). Single-flight: if a pipeline pass
    /// is already in progress for this session, the sample is dropped.
    pub async fn process_motion(&self, sample: MotionSample) {
        if self.session.subscribed_topic().is_none() {
            return;
        }

        if self
            .motion_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("motion pipeline busy, dropping sample");
            return;
        }
        let _guard = MotionBusyGuard(&self.motion_busy);

        if !self.focus.swap(true, Ordering::Relaxed) {
            tracing::info!("forcing focus true on first motion");
        }

        let config = self.config.snapshot().await;

        let _perspective = self.session.call_self("self:read", vec![Value::from("view.perspective")]).await;

        let Some(affine_value) = self.session.call_self("self:read", vec![Value::from("view.affine")]).await else {
            tracing::debug!("view.affine unreadable, dropping motion sample");
            return;
        };
        let Some(affine) = parse_affine(&affine_value) else {
            tracing::warn!("view.affine malformed, dropping motion sample");
            return;
        };

        let extents_value = self.session.call_self("self:read", vec![Value::from("model.extents")]).await;
        let extents = parse_extents(extents_value.as_ref()).unwrap_or([0.0; 6]);

        let axes = motion::condition_all(
            sample.tx,
            sample.ty,
            sample.tz,
            sample.rx,
            sample.ry,
            sample.rz,
            config.deadzone,
            config.gamma,
        );

        let pending_spin = {
            let mut guard = lock(&self.pending_spin);
            std::mem::replace(&mut *guard, 0.0)
        };

        let input = MotionInput {
            axes,
            trans_scale: config.trans_scale(),
            rot_scale: config.rot_scale(),
            pending_spin,
            spin_axis: config.spin_axis,
        };

        let new_affine = motion::apply_motion(&affine, &extents, &input);
        if new_affine == affine {
            return;
        }

        if self.session.call_self("self:update", vec![Value::from("motion"), Value::from(true)]).await.is_none() {
            tracing::debug!("motion=true write failed, skipping affine write");
            return;
        }
        let flat = new_affine.to_row_major();
        let flat_values: Vec<Value> = flat.iter().map(|v| serde_json::json!(v)).collect();
        let _ = self
            .session
            .call_self("self:update", vec![Value::from("view.affine"), Value::Array(flat_values)])
            .await;
    }

    /// Handles a button edge per spec §4.5's action table. `modifier` is
    /// implemented identically to `key` (press on both edges calling the
    /// same combo) per Design Notes §9 — a documented limitation of the
    /// source, not fixed here.
    pub async fn process_button(&self, sample: ButtonSample) {
        let config = self.config.snapshot().await;
        let Some(binding) = config.buttons.get(&sample.index.to_string()) else {
            return;
        };

        match binding.action {
            ButtonAction::Key if sample.pressed => {
                self.keyboard.press_combo(&binding.value);
            }
            ButtonAction::Modifier => {
                self.keyboard.press_combo(&binding.value);
            }
            ButtonAction::Logic if sample.pressed => match binding.value.as_str() {
                "lock_horizon" => {
                    let new_state = !self.horizon_locked.load(Ordering::Relaxed);
                    self.horizon_locked.store(new_state, Ordering::Relaxed);
                    tracing::info!(locked = new_state, "horizon lock toggled");
                }
                "spin_90" => {
                    *lock(&self.pending_spin) = -std::f64::consts::FRAC_PI_2;
                    tracing::info!("spin-90 triggered, flushing a zero motion sample");
                    self.process_motion(MotionSample {
                        tx: 0,
                        ty: 0,
                        tz: 0,
                        rx: 0,
                        ry: 0,
                        rz: 0,
                        period_ms: 0,
                        arrived_at: sample.arrived_at,
                    })
                    .await;
                }
                other => tracing::warn!(logic = other, "unknown logic button action"),
            },
            ButtonAction::OpenBrowser if sample.pressed => {
                self.keyboard.open_url("https://localhost:8181/config");
            }
            _ => {}
        }
    }
}

struct MotionBusyGuard<'a>(&'a AtomicBool);

impl Drop for MotionBusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn parse_affine(value: &Value) -> Option<Affine> {
    let arr = value.as_array()?;
    if arr.len() != 16 {
        return None;
    }
    let mut flat = [0.0f64; 16];
    for (i, slot) in arr.iter().enumerate() {
        flat[i] = slot.as_f64()?;
    }
    Some(Affine::from_row_major(&flat))
}

fn parse_extents(value: Option<&Value>) -> Option<[f64; 6]> {
    let arr = value?.as_array()?;
    if arr.len() != 6 {
        return None;
    }
    let mut extents = [0.0f64; 6];
    for (i, slot) in arr.iter().enumerate() {
        extents[i] = slot.as_f64()?;
    }
    Some(extents)
}
