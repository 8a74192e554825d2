//! Command canonicalization and typed field access
//!
//! A command line arrives addressed either by a modern hierarchical `op`
//! (`cursor/add`) or a legacy flat `cmd` (`add`, `clickId`). Both resolve to
//! one [`Action`]; `op` wins when both are present.

use std::path::PathBuf;

use super::entity::{
    self, Behavior, BehaviorKind, Color, Entity, EntityId, Point, COORD_RANGE, LAG_RANGE,
    RADIUS_RANGE, SIZE_RANGE, SPEED_RANGE,
};
use super::error::ProtocolError;
use super::record::Record;

/// Canonical action a command resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Create an entity
    Add,
    /// Remove one entity
    Remove,
    /// Replace fields of one entity
    Set,
    /// Adjust fields of one entity, absolute or by delta
    Tweak,
    /// Remove every entity
    Clear,
    /// Report every entity
    List,
    /// Report frame statistics
    Perf,
    /// Persist the entity collection
    Save,
    /// Replay the persisted entity collection
    Load,
    /// Force a re-read of the config file
    Reload,
    /// Shut the worker down
    Exit,
    /// Click at an entity's position
    Click,
    /// Press at an entity's position
    Down,
    /// Release at an entity's position
    Up,
    /// Drag from an entity's position
    Drag,
    /// Change the script host executable
    SetScriptHost,
    /// Change a display flag
    Debug,
    /// List the modern operation names
    Help,
}

/// Modern operation names, in the order `help` reports them.
pub const MODERN_OPS: &[(&str, Action)] = &[
    ("cursor/add", Action::Add),
    ("cursor/update", Action::Set),
    ("cursor/tweak", Action::Tweak),
    ("cursor/remove", Action::Remove),
    ("cursor/clear", Action::Clear),
    ("cursor/list", Action::List),
    ("mouse/click", Action::Click),
    ("mouse/down", Action::Down),
    ("mouse/up", Action::Up),
    ("mouse/drag", Action::Drag),
    ("state/save", Action::Save),
    ("state/load", Action::Load),
    ("state/reload", Action::Reload),
    ("sys/exit", Action::Exit),
    ("sys/perf", Action::Perf),
    ("config/setAhk", Action::SetScriptHost),
    ("debug/mode", Action::Debug),
    ("help", Action::Help),
];

impl Action {
    /// Resolve a modern operation name.
    pub fn from_op(op: &str) -> Result<Action, ProtocolError> {
        MODERN_OPS
            .iter()
            .find(|(name, _)| *name == op)
            .map(|(_, action)| *action)
            .ok_or_else(|| ProtocolError::UnknownOp(op.to_string()))
    }

    /// Resolve a legacy command name.
    pub fn from_cmd(cmd: &str) -> Result<Action, ProtocolError> {
        let action = match cmd {
            "add" => Action::Add,
            "remove" => Action::Remove,
            "set" => Action::Set,
            "tweak" => Action::Tweak,
            "clear" => Action::Clear,
            "list" => Action::List,
            "perf" => Action::Perf,
            "save" => Action::Save,
            "load" => Action::Load,
            "reload" => Action::Reload,
            "exit" => Action::Exit,
            "click" | "clickId" => Action::Click,
            "down" | "downId" => Action::Down,
            "up" | "upId" => Action::Up,
            "drag" | "dragId" => Action::Drag,
            "setAhk" => Action::SetScriptHost,
            "debug" => Action::Debug,
            "help" => Action::Help,
            other => return Err(ProtocolError::UnknownCmd(other.to_string())),
        };
        Ok(action)
    }
}

/// A parsed, canonicalized command.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Canonical action
    pub action: Action,
    /// All fields of the line, including `op`/`cmd`
    pub record: Record,
}

impl Command {
    /// Canonicalize a record. `Ok(None)` when it names no operation at all.
    pub fn from_record(record: Record) -> Result<Option<Command>, ProtocolError> {
        let action = if let Some(op) = record.get("op") {
            Action::from_op(op)?
        } else if let Some(cmd) = record.get("cmd") {
            Action::from_cmd(cmd)?
        } else {
            return Ok(None);
        };
        Ok(Some(Command { action, record }))
    }

    /// Parse and canonicalize one line.
    pub fn parse(line: &str) -> Result<Option<Command>, ProtocolError> {
        match Record::parse(line) {
            Some(record) => Command::from_record(record),
            None => Ok(None),
        }
    }

    /// Raw text of `field`.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.record.get(field)
    }

    /// Numeric `field`, if present.
    pub fn number(&self, field: &'static str) -> Result<Option<f64>, ProtocolError> {
        let Some(raw) = self.record.get(field) else {
            return Ok(None);
        };
        match raw.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Some(value)),
            _ => Err(ProtocolError::InvalidValue {
                field,
                value: raw.to_string(),
            }),
        }
    }

    /// Numeric `field` clamped into `range`.
    pub fn clamped(
        &self,
        field: &'static str,
        range: (f64, f64),
    ) -> Result<Option<f64>, ProtocolError> {
        Ok(self.number(field)?.map(|v| entity::clamp(v, range)))
    }

    /// Explicit id for `add`. Non-positive or unparsable ids ask for
    /// assignment.
    pub fn requested_id(&self) -> Option<EntityId> {
        let raw = self.record.get("id")?.trim();
        let value = raw.parse::<f64>().ok()?;
        (value >= 1.0 && value <= EntityId::MAX as f64).then_some(value as EntityId)
    }

    /// Required `id` for commands that address an entity.
    pub fn target_id(&self) -> Result<EntityId, ProtocolError> {
        let raw = self
            .record
            .get("id")
            .ok_or(ProtocolError::MissingField("id"))?;
        match raw.trim().parse::<i64>() {
            Ok(id) if id >= 1 && id <= EntityId::MAX as i64 => Ok(id as EntityId),
            _ => Err(ProtocolError::InvalidValue {
                field: "id",
                value: raw.to_string(),
            }),
        }
    }

    /// `behavior` field, if present.
    pub fn behavior(&self) -> Result<Option<BehaviorKind>, ProtocolError> {
        self.record
            .get("behavior")
            .map(|name| name.trim().parse())
            .transpose()
    }

    /// `color` field, if present.
    pub fn color(&self) -> Result<Option<Color>, ProtocolError> {
        self.record
            .get("color")
            .map(|raw| {
                Color::parse(raw.trim()).ok_or_else(|| ProtocolError::InvalidValue {
                    field: "color",
                    value: raw.to_string(),
                })
            })
            .transpose()
    }

    /// Pointer button index, clamped to 0..=2. Defaults to left.
    pub fn button(&self) -> Result<u8, ProtocolError> {
        Ok(self.clamped("button", (0.0, 2.0))?.unwrap_or(0.0) as u8)
    }

    /// Fields that `add` and `set` apply.
    pub fn entity_fields(&self) -> Result<EntityFields, ProtocolError> {
        Ok(EntityFields {
            x: self.clamped("x", COORD_RANGE)?,
            y: self.clamped("y", COORD_RANGE)?,
            offset_x: self.clamped("offsetX", COORD_RANGE)?,
            offset_y: self.clamped("offsetY", COORD_RANGE)?,
            radius: self.clamped("radius", RADIUS_RANGE)?,
            speed: self.clamped("speed", SPEED_RANGE)?,
            lag_ms: self.clamped("lagMs", LAG_RANGE)?,
            size: self.clamped("size", SIZE_RANGE)?.map(|v| v as u32),
            color: self.color()?,
            script: self.text("script").map(PathBuf::from),
        })
    }

    /// Fields that `tweak` applies.
    pub fn tweak_fields(&self) -> Result<TweakFields, ProtocolError> {
        Ok(TweakFields {
            radius: self.clamped("radius", RADIUS_RANGE)?,
            radius_delta: self.number("radiusDelta")?,
            speed: self.clamped("speed", SPEED_RANGE)?,
            speed_delta: self.number("speedDelta")?,
            lag_ms: self.clamped("lagMs", LAG_RANGE)?,
            offset_x: self.clamped("offsetX", COORD_RANGE)?,
            offset_y: self.clamped("offsetY", COORD_RANGE)?,
            size: self.clamped("size", SIZE_RANGE)?.map(|v| v as u32),
            color: self.color()?,
        })
    }

    /// Drag destination relative to the start point `from`.
    pub fn drag_target(&self, from: Point) -> Result<Point, ProtocolError> {
        let tx = self.clamped("tx", COORD_RANGE)?;
        let ty = self.clamped("ty", COORD_RANGE)?;
        if let (Some(x), Some(y)) = (tx, ty) {
            return Ok(Point::new(x, y));
        }
        let dx = self.clamped("dx", COORD_RANGE)?;
        let dy = self.clamped("dy", COORD_RANGE)?;
        if let (Some(dx), Some(dy)) = (dx, dy) {
            return Ok(from.offset(dx, dy));
        }
        Ok(from)
    }
}

/// Validated entity fields from an `add` or `set` command. Every field is
/// optional; absent fields leave the entity untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFields {
    /// Absolute horizontal position or target
    pub x: Option<f64>,
    /// Absolute vertical position or target
    pub y: Option<f64>,
    /// Mirror horizontal offset
    pub offset_x: Option<f64>,
    /// Mirror vertical offset
    pub offset_y: Option<f64>,
    /// Orbit radius
    pub radius: Option<f64>,
    /// Orbit speed
    pub speed: Option<f64>,
    /// Follow lag
    pub lag_ms: Option<f64>,
    /// Render size
    pub size: Option<u32>,
    /// Render color
    pub color: Option<Color>,
    /// Script path
    pub script: Option<PathBuf>,
}

impl EntityFields {
    /// Apply present fields to `entity`. Parameters that do not belong to the
    /// entity's behavior are ignored.
    pub fn apply(&self, entity: &mut Entity) {
        if let Some(x) = self.x {
            entity.position.x = x;
        }
        if let Some(y) = self.y {
            entity.position.y = y;
        }
        let position = entity.position;
        match &mut entity.behavior {
            Behavior::Mirror { offset_x, offset_y } => {
                set(offset_x, self.offset_x);
                set(offset_y, self.offset_y);
            }
            Behavior::Static { target } => {
                if self.x.is_some() || self.y.is_some() {
                    *target = position;
                }
            }
            Behavior::Orbit { radius, speed, .. } => {
                set(radius, self.radius);
                set(speed, self.speed);
            }
            Behavior::FollowLag { lag_ms, .. } => {
                set(lag_ms, self.lag_ms);
            }
            Behavior::Scripted { script, target } => {
                if let Some(path) = &self.script {
                    *script = path.clone();
                }
                if self.x.is_some() || self.y.is_some() {
                    *target = position;
                }
            }
        }
        if let Some(size) = self.size {
            entity.size = size;
        }
        if let Some(color) = self.color {
            entity.color = color;
        }
    }
}

/// Validated `tweak` fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TweakFields {
    /// Absolute orbit radius
    pub radius: Option<f64>,
    /// Orbit radius change
    pub radius_delta: Option<f64>,
    /// Absolute orbit speed
    pub speed: Option<f64>,
    /// Orbit speed change
    pub speed_delta: Option<f64>,
    /// Absolute follow lag
    pub lag_ms: Option<f64>,
    /// Absolute mirror horizontal offset
    pub offset_x: Option<f64>,
    /// Absolute mirror vertical offset
    pub offset_y: Option<f64>,
    /// Render size
    pub size: Option<u32>,
    /// Render color
    pub color: Option<Color>,
}

impl TweakFields {
    /// Apply to `entity`. Absolute values are applied before deltas.
    pub fn apply(&self, entity: &mut Entity) {
        match &mut entity.behavior {
            Behavior::Orbit { radius, speed, .. } => {
                set(radius, self.radius);
                if let Some(delta) = self.radius_delta {
                    *radius = entity::clamp(*radius + delta, RADIUS_RANGE);
                }
                set(speed, self.speed);
                if let Some(delta) = self.speed_delta {
                    *speed = entity::clamp(*speed + delta, SPEED_RANGE);
                }
            }
            Behavior::FollowLag { lag_ms, .. } => set(lag_ms, self.lag_ms),
            Behavior::Mirror { offset_x, offset_y } => {
                set(offset_x, self.offset_x);
                set(offset_y, self.offset_y);
            }
            Behavior::Static { .. } | Behavior::Scripted { .. } => {}
        }
        if let Some(size) = self.size {
            entity.size = size;
        }
        if let Some(color) = self.color {
            entity.color = color;
        }
    }
}

fn set(slot: &mut f64, value: Option<f64>) {
    if let Some(value) = value {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(line: &str) -> Command {
        Command::parse(line).unwrap().unwrap()
    }

    #[test]
    fn every_modern_op_maps_to_a_legacy_name() {
        let legacy = [
            "add", "set", "tweak", "remove", "clear", "list", "clickId", "downId", "upId",
            "dragId", "save", "load", "reload", "exit", "perf", "setAhk", "debug", "help",
        ];
        assert_eq!(MODERN_OPS.len(), legacy.len());
        for ((op, action), cmd) in MODERN_OPS.iter().zip(legacy) {
            assert_eq!(Action::from_op(op), Ok(*action));
            assert_eq!(Action::from_cmd(cmd), Ok(*action), "{op} vs {cmd}");
        }
    }

    #[test]
    fn op_wins_over_cmd() {
        let cmd = command(r#"{"cmd":"remove","op":"cursor/list"}"#);
        assert_eq!(cmd.action, Action::List);
    }

    #[test]
    fn unknown_names_are_errors() {
        assert_eq!(
            Command::parse(r#"{"op":"cursor/fly"}"#),
            Err(ProtocolError::UnknownOp("cursor/fly".into()))
        );
        assert_eq!(
            Command::parse(r#"{"cmd":"fly"}"#),
            Err(ProtocolError::UnknownCmd("fly".into()))
        );
    }

    #[test]
    fn lines_without_an_operation_are_ignored() {
        assert_eq!(Command::parse(r#"{"id":3}"#), Ok(None));
        assert_eq!(Command::parse("hello"), Ok(None));
    }

    #[test]
    fn numeric_fields_are_clamped() {
        let cmd = command(
            r#"{"cmd":"add","size":1000,"radius":-5,"speed":500,"lagMs":0,"x":1e9}"#,
        );
        let fields = cmd.entity_fields().unwrap();
        assert_eq!(fields.size, Some(399));
        assert_eq!(fields.radius, Some(0.0));
        assert_eq!(fields.speed, Some(100.0));
        assert_eq!(fields.lag_ms, Some(1.0));
        assert_eq!(fields.x, Some(100_000.0));
    }

    #[test]
    fn non_numeric_values_are_rejected() {
        let cmd = command(r#"{"cmd":"add","radius":"wide"}"#);
        assert_eq!(
            cmd.entity_fields(),
            Err(ProtocolError::InvalidValue {
                field: "radius",
                value: "wide".into()
            })
        );
        let cmd = command(r#"{"cmd":"add","color":"red"}"#);
        assert!(cmd.entity_fields().is_err());
    }

    #[test]
    fn ids() {
        assert_eq!(command(r#"{"cmd":"add","id":7}"#).requested_id(), Some(7));
        assert_eq!(command(r#"{"cmd":"add","id":-2}"#).requested_id(), None);
        assert_eq!(command(r#"{"cmd":"add","id":"x"}"#).requested_id(), None);
        assert_eq!(
            command(r#"{"cmd":"remove"}"#).target_id(),
            Err(ProtocolError::MissingField("id"))
        );
        assert_eq!(command(r#"{"cmd":"remove","id":"12"}"#).target_id(), Ok(12));
    }

    #[test]
    fn drag_target_prefers_absolute() {
        let from = Point::new(10.0, 10.0);
        let both = command(r#"{"cmd":"drag","id":1,"tx":50,"ty":60,"dx":1,"dy":1}"#);
        assert_eq!(both.drag_target(from), Ok(Point::new(50.0, 60.0)));
        let relative = command(r#"{"cmd":"drag","id":1,"dx":5,"dy":-5}"#);
        assert_eq!(relative.drag_target(from), Ok(Point::new(15.0, 5.0)));
        let partial = command(r#"{"cmd":"drag","id":1,"tx":5}"#);
        assert_eq!(partial.drag_target(from), Ok(from));
    }

    #[test]
    fn static_fields_move_the_target() {
        let mut entity = Entity::new(Behavior::default_for(BehaviorKind::Static));
        command(r#"{"cmd":"set","id":1,"x":30,"y":40,"radius":9}"#)
            .entity_fields()
            .unwrap()
            .apply(&mut entity);
        assert_eq!(
            entity.behavior,
            Behavior::Static {
                target: Point::new(30.0, 40.0)
            }
        );
    }

    #[test]
    fn tweak_deltas_apply_after_absolutes_and_clamp() {
        let mut entity = Entity::new(Behavior::default_for(BehaviorKind::Orbit));
        command(r#"{"cmd":"tweak","id":1,"radius":100,"radiusDelta":-30,"speedDelta":250}"#)
            .tweak_fields()
            .unwrap()
            .apply(&mut entity);
        match entity.behavior {
            Behavior::Orbit { radius, speed, .. } => {
                assert_eq!(radius, 70.0);
                assert_eq!(speed, 100.0);
            }
            other => panic!("unexpected behavior {other:?}"),
        }
    }
}
