//! Games written in Lua.
//!
//! `games/<name>/main.lua` returns one table: app metadata, thresholds, item
//! scores, the `states` graph, and optional hook functions
//! `branch(ctx)`, `is_new_cycle(frame, device)`, `process_items(frame, device)`
//! and `score(items)`. Hooks see frames as userdata with
//! `frame:detect(template [, threshold])`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use mlua::prelude::*;
use mlua::DeserializeOptions;
use serde::Deserialize;
use tracing::{info, warn};

use crate::detect::Detector;
use crate::error::{Error, Result};
use crate::game::*;
use crate::graph::{AutomationGraph, GraphDef, StateDefinition};
use crate::lock;
use crate::logger;
use crate::types::{AppTarget, Frame};

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_cycles() -> u32 {
    DEFAULT_CYCLES_PER_SESSION
}

fn default_item_score() -> u64 {
    DEFAULT_ITEM_SCORE
}

/// Data part of the table returned by `main.lua`. Hook functions are skipped.
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    package: String,
    activity: String,
    #[serde(default = "default_cycles")]
    cycles_per_session: u32,
    #[serde(default)]
    notify_threshold: Option<u64>,
    #[serde(default = "default_threshold")]
    default_threshold: f64,
    #[serde(default)]
    template_thresholds: HashMap<String, f64>,
    #[serde(default)]
    item_scores: HashMap<String, u64>,
    #[serde(default = "default_item_score")]
    default_item_score: u64,
    #[serde(default)]
    entry: Option<String>,
    states: BTreeMap<String, StateDefinition>,
}

/// Name and description shown by `--list-games`.
#[derive(Debug, Clone, PartialEq)]
pub struct GameInfo {
    pub name: String,
    pub display_name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
struct Thresholds {
    default: f64,
    templates: HashMap<String, f64>,
}

impl Thresholds {
    fn get(&self, template: &str) -> f64 {
        self.templates.get(template).copied().unwrap_or(self.default)
    }
}

/// Frame handed to Lua hooks.
struct LuaFrame {
    frame: Arc<Frame>,
    detector: Arc<dyn Detector>,
    thresholds: Arc<Thresholds>,
}

impl LuaUserData for LuaFrame {
    fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("width", |_, this| Ok(this.frame.width));
        fields.add_field_method_get("height", |_, this| Ok(this.frame.height));
    }

    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        // frame:detect(template [, threshold]) -> { x, y, confidence } or nil
        methods.add_method("detect", |lua, this, (template, threshold): (String, Option<f64>)| {
            let threshold = threshold.unwrap_or_else(|| this.thresholds.get(&template));
            match this.detector.detect(&this.frame, &template, threshold) {
                Ok(Some(d)) if d.confidence >= threshold => {
                    let t = lua.create_table()?;
                    t.set("x", d.at.x)?;
                    t.set("y", d.at.y)?;
                    t.set("confidence", d.confidence)?;
                    Ok(LuaValue::Table(t))
                }
                Ok(_) => Ok(LuaNil),
                Err(e) => Err(LuaError::external(e)),
            }
        });
    }
}

/// Everything read once from `main.lua` and shared by all instances.
struct GameData {
    script_path: PathBuf,
    name: String,
    display_name: String,
    app: AppTarget,
    graph: Arc<AutomationGraph>,
    cycles_per_session: u32,
    notify_threshold: Option<u64>,
    thresholds: Arc<Thresholds>,
    scores: ScoreTable,
    detector: Arc<dyn Detector>,
}

/// A loaded game. Each instance gets its own VM through
/// [`Game::for_instance`]; the graph and tables stay shared.
pub struct LuaGame {
    lua: Mutex<Lua>,
    game_key: LuaRegistryKey,
    data: Arc<GameData>,
}

/// Fresh VM with `F.*` globals and `require` rooted at the game directory.
fn new_vm(script_path: &Path, tag: &str) -> Result<Lua> {
    let lua = Lua::new();
    register_globals(&lua, tag)?;
    if let Some(game_dir) = script_path.parent() {
        let dir_str = game_dir.to_string_lossy();
        let pkg: LuaTable = lua.globals().get("package")?;
        pkg.set("path", format!("{}/?.lua;{}/?/init.lua", dir_str, dir_str))?;
    }
    Ok(lua)
}

fn eval_script(lua: &Lua, script_path: &Path) -> Result<LuaTable> {
    if !script_path.is_file() {
        return Err(Error::GameNotFound { path: script_path.to_path_buf() });
    }
    let code = std::fs::read_to_string(script_path)?;
    let table = lua.load(&code).set_name(script_path.to_string_lossy()).eval()?;
    Ok(table)
}

fn read_manifest(lua: &Lua, table: &LuaTable) -> Result<Manifest> {
    let options = DeserializeOptions::new().deny_unsupported_types(false);
    Ok(lua.from_value_with(LuaValue::Table(table.clone()), options)?)
}

fn dir_name(script_path: &Path) -> String {
    script_path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "game".into())
}

impl LuaGame {
    /// Load just enough of a game to list it.
    pub fn describe(script_path: &Path) -> Result<GameInfo> {
        let fallback = dir_name(script_path);
        let lua = new_vm(script_path, "")?;
        let table = eval_script(&lua, script_path)?;
        let manifest = read_manifest(&lua, &table)?;
        let name = manifest.name.unwrap_or(fallback);
        Ok(GameInfo {
            display_name: manifest.display_name.unwrap_or_else(|| name.clone()),
            description: manifest.description.unwrap_or_default(),
            name,
        })
    }

    /// Load a game script and validate its automation graph.
    pub fn load(script_path: &Path, detector: Arc<dyn Detector>) -> Result<Self> {
        let fallback = dir_name(script_path);
        let lua = new_vm(script_path, &fallback)?;
        let table = eval_script(&lua, script_path)?;
        let manifest = read_manifest(&lua, &table)?;

        for (template, t) in &manifest.template_thresholds {
            if !(0.0..=1.0).contains(t) {
                return Err(Error::config(format!("threshold for '{}' must be between 0.0 and 1.0", template)));
            }
        }

        let graph = AutomationGraph::from_def(GraphDef { entry: manifest.entry, states: manifest.states })?;
        let game_key = lua.create_registry_value(table)?;
        let name = manifest.name.unwrap_or(fallback);
        info!("loaded game '{}' ({} states, entry '{}')", name, graph.len(), graph.entry());

        let data = GameData {
            script_path: script_path.to_path_buf(),
            display_name: manifest.display_name.unwrap_or_else(|| name.clone()),
            name,
            app: AppTarget { package: manifest.package, activity: manifest.activity },
            graph: Arc::new(graph),
            cycles_per_session: manifest.cycles_per_session,
            notify_threshold: manifest.notify_threshold,
            thresholds: Arc::new(Thresholds {
                default: manifest.default_threshold,
                templates: manifest.template_thresholds,
            }),
            scores: ScoreTable::new(manifest.item_scores, manifest.default_item_score),
            detector,
        };
        Ok(Self { lua: Mutex::new(lua), game_key, data: Arc::new(data) })
    }

    fn frame_userdata(&self, lua: &Lua, frame: &Frame) -> LuaResult<LuaAnyUserData> {
        lua.create_userdata(LuaFrame {
            frame: Arc::new(frame.clone()),
            detector: Arc::clone(&self.data.detector),
            thresholds: Arc::clone(&self.data.thresholds),
        })
    }

    /// Call the hook `name` if the game defines it.
    fn with_hook<R>(&self, name: &str, call: impl FnOnce(&Lua, LuaFunction) -> LuaResult<R>) -> Result<Option<R>> {
        let lua = lock(&self.lua);
        let table: LuaTable = lua.registry_value(&self.game_key)?;
        let Some(func) = table.get::<Option<LuaFunction>>(name)? else {
            return Ok(None);
        };
        Ok(Some(call(&lua, func)?))
    }
}

impl Game for LuaGame {
    fn name(&self) -> &str {
        &self.data.name
    }

    fn display_name(&self) -> &str {
        &self.data.display_name
    }

    fn app(&self) -> &AppTarget {
        &self.data.app
    }

    fn graph(&self) -> Arc<AutomationGraph> {
        Arc::clone(&self.data.graph)
    }

    fn for_instance(self: Arc<Self>, device: &str) -> Result<Arc<dyn Game>> {
        let lua = new_vm(&self.data.script_path, device)?;
        let table = eval_script(&lua, &self.data.script_path)?;
        let game_key = lua.create_registry_value(table)?;
        Ok(Arc::new(LuaGame { lua: Mutex::new(lua), game_key, data: Arc::clone(&self.data) }))
    }

    fn template_threshold(&self, template: &str) -> f64 {
        self.data.thresholds.get(template)
    }

    fn cycles_per_session(&self) -> u32 {
        self.data.cycles_per_session
    }

    fn notify_threshold(&self) -> Option<u64> {
        self.data.notify_threshold
    }

    fn resolve_branch(&self, ctx: &BranchContext) -> Result<String> {
        let branch_error = |message: String| Error::Branch { state: ctx.state.clone(), message };
        let chosen = self
            .with_hook("branch", |lua, f| {
                let arg = lua.to_value(ctx)?;
                if let LuaValue::Table(t) = &arg {
                    t.set("frame", self.frame_userdata(lua, &ctx.frame)?)?;
                }
                f.call::<String>(arg)
            })
            .map_err(|e| branch_error(e.to_string()))?;
        chosen.ok_or_else(|| branch_error("several next states but the game defines no branch()".into()))
    }

    fn is_new_cycle(&self, frame: &Frame, device: &str) -> Result<bool> {
        let result = self.with_hook("is_new_cycle", |lua, f| {
            f.call::<bool>((self.frame_userdata(lua, frame)?, device))
        })?;
        Ok(result.unwrap_or(true))
    }

    fn process_items(&self, frame: &Frame, device: &str) -> Result<Vec<String>> {
        let result = self.with_hook("process_items", |lua, f| {
            f.call::<Vec<String>>((self.frame_userdata(lua, frame)?, device))
        })?;
        Ok(result.unwrap_or_default())
    }

    fn score(&self, items: &[String]) -> ScoreReport {
        let scripted = self.with_hook("score", |_, f| f.call::<f64>(items.to_vec()));
        match scripted {
            Ok(Some(total)) => ScoreReport { total: total.max(0.0).round() as u64, breakdown: BTreeMap::new() },
            Ok(None) => self.data.scores.score(items),
            Err(e) => {
                warn!("{}: score() failed, using item table: {}", self.data.name, e);
                self.data.scores.score(items)
            }
        }
    }
}

/// Register the F.* global table into a Lua state.
fn register_globals(lua: &Lua, tag: &str) -> LuaResult<()> {
    let f_table = lua.create_table()?;

    // F.log(msg), prefixed with the game name (blue)
    let tag = tag.to_string();
    if !tag.is_empty() {
        logger::register_prefix(&tag, logger::COLOR_BLUE);
    }
    let log_fn = lua.create_function(move |_, msg: String| {
        if tag.is_empty() {
            info!("{}", msg);
        } else {
            info!(instance = %tag, "{}", msg);
        }
        Ok(())
    })?;
    f_table.set("log", log_fn)?;

    lua.globals().set("F", f_table)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedDetector;

    const GAME: &str = r#"
local game = {
    name = "demo",
    display_name = "Demo Gacha",
    description = "pulls until the banner runs out",
    package = "com.example.demo",
    activity = "com.example.demo/.Main",
    cycles_per_session = 3,
    notify_threshold = 100,
    template_thresholds = { rare_star = 0.9 },
    item_scores = { SSR = 50 },
    entry = "home",
    states = {
        home = {
            timeout = 30,
            templates = { "home_banner" },
            actions = { { type = "tap", template = "pull_button" } },
            next_states = { "result" },
        },
        result = {
            actions = {},
            processes_items = true,
            next_states = { "home", "reroll" },
        },
        reroll = {
            actions = { { type = "restart", timeout = 20 } },
            next_states = { "home" },
        },
    },
}

function game.branch(ctx)
    if ctx.cycle_index >= ctx.cycles_per_session then
        return "reroll"
    end
    return "home"
end

function game.process_items(frame, device)
    local items = {}
    if frame:detect("rare_star") then
        table.insert(items, "SSR")
    end
    table.insert(items, "common")
    return items
end

return game
"#;

    fn write_game(dir: &Path, code: &str) -> std::path::PathBuf {
        let game_dir = dir.join("demo");
        std::fs::create_dir_all(&game_dir).unwrap();
        let path = game_dir.join("main.lua");
        std::fs::write(&path, code).unwrap();
        path
    }

    fn ctx(cycle_index: u32) -> BranchContext {
        BranchContext {
            device: "emulator-5554".into(),
            state: "result".into(),
            candidates: vec!["home".into(), "reroll".into()],
            cycle_index,
            cycles_per_session: 3,
            counter: 0,
            score: 0,
            session_count: 0,
            frame: Frame::default(),
        }
    }

    #[test]
    fn test_load_reads_metadata_and_graph() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_game(dir.path(), GAME);
        let game = LuaGame::load(&path, Arc::new(ScriptedDetector::new())).unwrap();
        assert_eq!(game.name(), "demo");
        assert_eq!(game.display_name(), "Demo Gacha");
        assert_eq!(game.app().package, "com.example.demo");
        assert_eq!(game.cycles_per_session(), 3);
        assert_eq!(game.template_threshold("rare_star"), 0.9);
        assert_eq!(game.template_threshold("other"), 0.8);

        let graph = game.graph();
        assert_eq!(graph.entry(), "home");
        let home = graph.state("home").unwrap();
        assert_eq!(home.required_templates, vec!["home_banner"]);
        assert_eq!(home.timeout, Some(30.0));
        assert!(graph.state("result").unwrap().actions.is_empty());
    }

    #[test]
    fn test_branch_hook_sees_context() {
        let dir = tempfile::tempdir().unwrap();
        let game = LuaGame::load(&write_game(dir.path(), GAME), Arc::new(ScriptedDetector::new())).unwrap();
        assert_eq!(game.resolve_branch(&ctx(1)).unwrap(), "home");
        assert_eq!(game.resolve_branch(&ctx(3)).unwrap(), "reroll");
    }

    #[test]
    fn test_process_items_uses_frame_detection() {
        let dir = tempfile::tempdir().unwrap();
        let detector = Arc::new(ScriptedDetector::new());
        detector.script("rare_star", [true, false]);
        let game = LuaGame::load(&write_game(dir.path(), GAME), detector).unwrap();

        let first = game.process_items(&Frame::default(), "emulator-5554").unwrap();
        assert_eq!(first, vec!["SSR", "common"]);
        let second = game.process_items(&Frame::default(), "emulator-5554").unwrap();
        assert_eq!(second, vec!["common"]);
        assert!(game.is_new_cycle(&Frame::default(), "emulator-5554").unwrap());
        assert_eq!(game.score(&first).total, 55);
    }

    /// Blocks every detection until the test lets it through.
    struct GateDetector {
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl Detector for GateDetector {
        fn detect(
            &self,
            _frame: &Frame,
            _template: &str,
            _threshold: f64,
        ) -> std::result::Result<Option<crate::types::Detection>, crate::error::ActionError> {
            lock(&self.entered).send(()).ok();
            lock(&self.release).recv().ok();
            Ok(None)
        }
    }

    #[test]
    fn test_instances_run_hooks_independently() {
        let dir = tempfile::tempdir().unwrap();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let detector = Arc::new(GateDetector { entered: Mutex::new(entered_tx), release: Mutex::new(release_rx) });
        let game = Arc::new(LuaGame::load(&write_game(dir.path(), GAME), detector).unwrap());
        let slow = Arc::clone(&game).for_instance("emulator-5554").unwrap();
        let quick = Arc::clone(&game).for_instance("emulator-5556").unwrap();
        assert!(Arc::ptr_eq(&slow.graph(), &quick.graph()));

        let worker = std::thread::spawn(move || slow.process_items(&Frame::default(), "emulator-5554"));
        entered_rx.recv().unwrap();
        // the other device's VM is free while the first one waits on detection
        assert!(quick.is_new_cycle(&Frame::default(), "emulator-5556").unwrap());
        assert_eq!(quick.resolve_branch(&ctx(3)).unwrap(), "reroll");

        release_tx.send(()).unwrap();
        assert_eq!(worker.join().unwrap().unwrap(), vec!["common"]);
    }

    #[test]
    fn test_invalid_graph_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let code = r#"return { package = "p", activity = "a", states = { a = { next_states = { "nowhere" } } } }"#;
        let err = LuaGame::load(&write_game(dir.path(), code), Arc::new(ScriptedDetector::new())).err().unwrap();
        assert!(matches!(err, Error::Graph { .. }), "{}", err);
    }

    #[test]
    fn test_missing_branch_hook_is_a_branch_error() {
        let dir = tempfile::tempdir().unwrap();
        let code = r#"return { package = "p", activity = "a", entry = "a", states = {
            a = { next_states = { "a", "b" } }, b = { next_states = { "a" } } } }"#;
        let game = LuaGame::load(&write_game(dir.path(), code), Arc::new(ScriptedDetector::new())).unwrap();
        let mut c = ctx(0);
        c.state = "a".into();
        assert!(game.resolve_branch(&c).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_describe_and_missing_script() {
        let dir = tempfile::tempdir().unwrap();
        let info = LuaGame::describe(&write_game(dir.path(), GAME)).unwrap();
        assert_eq!(info.name, "demo");
        assert_eq!(info.description, "pulls until the banner runs out");
        let missing = LuaGame::describe(&dir.path().join("nope/main.lua")).err().unwrap();
        assert!(matches!(missing, Error::GameNotFound { .. }));
    }
}
