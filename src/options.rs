//! Driver options (C7, §5): mode selection, polling interval, function-map
//! overrides and check/reload hook observers.
//!
//! Modeled on `original_source/options.go`'s functional-options pattern,
//! translated into an owned builder since Rust has no closure-capturing
//! `template.FuncMap` equivalent to mutate in place.

use std::collections::HashMap;
use std::sync::Arc;

use minijinja::value::Value as TemplateValue;

use crate::error::Error;

/// `(resource_name, rendered_cmd, error)`. A hook must never abort the
/// pipeline; callers only log whatever it does.
pub type CmdHook = Arc<dyn Fn(&str, &str, Option<&Error>) + Send + Sync>;

pub type FuncMapUpdater = Arc<dyn Fn(&mut HashMap<String, TemplateValue>) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Unset,
    Onetime,
    Interval,
    Watch,
}

#[derive(Clone, Default)]
pub struct Options {
    onetime_mode: bool,
    interval_mode: bool,
    watch_mode: bool,
    interval: Option<std::time::Duration>,
    func_map: HashMap<String, TemplateValue>,
    func_map_updaters: Vec<FuncMapUpdater>,
    before_check_cmd: Option<CmdHook>,
    after_check_cmd: Option<CmdHook>,
    before_reload_cmd: Option<CmdHook>,
    after_reload_cmd: Option<CmdHook>,
}

pub const DEFAULT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(600);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn onetime_mode(mut self) -> Self {
        self.onetime_mode = true;
        self
    }

    pub fn interval_mode(mut self) -> Self {
        self.interval_mode = true;
        self
    }

    pub fn watch_mode(mut self) -> Self {
        self.watch_mode = true;
        self
    }

    pub fn interval(mut self, interval: std::time::Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn func_map(mut self, map: HashMap<String, TemplateValue>) -> Self {
        self.func_map.extend(map);
        self
    }

    pub fn func_map_updater(mut self, updater: FuncMapUpdater) -> Self {
        self.func_map_updaters.push(updater);
        self
    }

    pub fn before_check_cmd(mut self, hook: CmdHook) -> Self {
        self.before_check_cmd = Some(hook);
        self
    }

    pub fn after_check_cmd(mut self, hook: CmdHook) -> Self {
        self.after_check_cmd = Some(hook);
        self
    }

    pub fn before_reload_cmd(mut self, hook: CmdHook) -> Self {
        self.before_reload_cmd = Some(hook);
        self
    }

    pub fn after_reload_cmd(mut self, hook: CmdHook) -> Self {
        self.after_reload_cmd = Some(hook);
        self
    }

    /// Resolved per §4.5.1: onetime, then interval, then watch, then unset.
    pub fn mode(&self) -> Mode {
        if self.onetime_mode {
            Mode::Onetime
        } else if self.interval_mode {
            Mode::Interval
        } else if self.watch_mode {
            Mode::Watch
        } else {
            Mode::Unset
        }
    }

    /// Non-positive or unset intervals fall back to 600s.
    pub fn resolved_interval(&self) -> std::time::Duration {
        match self.interval {
            Some(d) if !d.is_zero() => d,
            _ => DEFAULT_INTERVAL,
        }
    }

    pub fn extra_functions(&self) -> &HashMap<String, TemplateValue> {
        &self.func_map
    }

    pub fn func_map_updaters(&self) -> &[FuncMapUpdater] {
        &self.func_map_updaters
    }

    /// Runs a hook if present, swallowing nothing but also never
    /// propagating: a misbehaving hook must not abort the pipeline.
    pub fn run_hook(hook: &Option<CmdHook>, resource_name: &str, cmd: &str, error: Option<&Error>) {
        if let Some(hook) = hook {
            hook(resource_name, cmd, error);
        }
    }

    pub fn before_check_cmd_hook(&self) -> &Option<CmdHook> {
        &self.before_check_cmd
    }

    pub fn after_check_cmd_hook(&self) -> &Option<CmdHook> {
        &self.after_check_cmd
    }

    pub fn before_reload_cmd_hook(&self) -> &Option<CmdHook> {
        &self.before_reload_cmd
    }

    pub fn after_reload_cmd_hook(&self) -> &Option<CmdHook> {
        &self.after_reload_cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_resolution_precedence() {
        assert_eq!(Options::new().mode(), Mode::Unset);
        assert_eq!(Options::new().watch_mode().mode(), Mode::Watch);
        assert_eq!(Options::new().interval_mode().watch_mode().mode(), Mode::Interval);
        assert_eq!(
            Options::new().onetime_mode().interval_mode().watch_mode().mode(),
            Mode::Onetime
        );
    }

    #[test]
    fn interval_falls_back_on_non_positive() {
        assert_eq!(Options::new().resolved_interval(), DEFAULT_INTERVAL);
        assert_eq!(
            Options::new().interval(std::time::Duration::ZERO).resolved_interval(),
            DEFAULT_INTERVAL
        );
        let custom = std::time::Duration::from_secs(5);
        assert_eq!(Options::new().interval(custom).resolved_interval(), custom);
    }

    #[test]
    fn hooks_do_not_panic_when_absent() {
        Options::run_hook(&None, "nginx", "nginx -t", None);
    }
}
