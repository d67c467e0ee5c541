//! Line-oriented control protocol read from stdin.
//!
//! ```text
//! load PATH      queue a new main shader
//! on N | off N   activate / deactivate slot N (0-based)
//! toggle N
//! value N X      set slot N's value, clamped to [0, 1]
//! status         print every slot
//! reinit         rebuild all GPU resources
//! ```

use std::fmt::Write as _;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Result};
use renderer::{ControlHandle, RendererProxy, NODE_COUNT};

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Load(PathBuf),
    Activate(usize, bool),
    Toggle(usize),
    Value(usize, f32),
    Status,
    Reinit,
}

fn parse_slot(token: Option<&str>) -> Result<usize, String> {
    let token = token.ok_or_else(|| "missing slot index".to_string())?;
    let slot = token
        .parse::<usize>()
        .map_err(|_| format!("invalid slot '{token}'"))?;
    if slot >= NODE_COUNT {
        return Err(format!("slot {slot} out of range (0-{})", NODE_COUNT - 1));
    }
    Ok(slot)
}

impl ControlCommand {
    /// Parses one line. Blank lines and `#` comments yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (verb, rest) = line
            .split_once(char::is_whitespace)
            .map(|(verb, rest)| (verb, rest.trim()))
            .unwrap_or((line, ""));
        let mut args = rest.split_whitespace();
        let command = match verb.to_ascii_lowercase().as_str() {
            "load" => {
                if rest.is_empty() {
                    return Err("load requires a path".into());
                }
                Self::Load(PathBuf::from(rest))
            }
            "on" => Self::Activate(parse_slot(args.next())?, true),
            "off" => Self::Activate(parse_slot(args.next())?, false),
            "toggle" => Self::Toggle(parse_slot(args.next())?),
            "value" => {
                let slot = parse_slot(args.next())?;
                let raw = args.next().ok_or_else(|| "missing value".to_string())?;
                let value = raw
                    .parse::<f32>()
                    .ok()
                    .filter(|value| !value.is_nan())
                    .ok_or_else(|| format!("invalid value '{raw}'"))?;
                Self::Value(slot, value)
            }
            "status" => Self::Status,
            "reinit" => Self::Reinit,
            other => return Err(format!("unknown command '{other}'")),
        };
        Ok(Some(command))
    }

    /// Applies the command and returns the line to print back.
    pub fn apply(&self, controls: &ControlHandle) -> String {
        match self {
            Self::Load(path) => controls.set_main_shader_path(path),
            Self::Activate(slot, active) => {
                controls.set_slot_active(*slot, *active);
                format!("slot {slot} {}", if *active { "on" } else { "off" })
            }
            Self::Toggle(slot) => {
                let active = controls.toggle_slot(*slot);
                format!("slot {slot} {}", if active { "on" } else { "off" })
            }
            Self::Value(slot, value) => {
                controls.set_slot_value(*slot, *value);
                format!("slot {slot} value {:.3}", controls.slot_value(*slot))
            }
            Self::Status => render_status(controls),
            Self::Reinit => {
                controls.request_reinit();
                "reinit requested".to_string()
            }
        }
    }
}

pub fn render_status(controls: &ControlHandle) -> String {
    let snapshot = controls.snapshot();
    let mut out = String::new();
    let main = snapshot
        .main_shader
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "(fallback)".to_string());
    let _ = writeln!(out, "main: {main}");
    if let Some(pending) = &snapshot.pending_main {
        let _ = writeln!(out, "pending: {}", pending.display());
    }
    for slot in &snapshot.slots {
        let name = slot.shader_name.as_deref().unwrap_or("-");
        let _ = writeln!(
            out,
            "slot {}: {:<3} value={:.3} loaded={} shader={name}",
            slot.index,
            if slot.active { "on" } else { "off" },
            slot.value,
            slot.loaded,
        );
    }
    let _ = write!(out, "dropped video frames: {}", snapshot.dropped_video_frames);
    out
}

/// Reads commands from `input` until EOF, applying each and waking the
/// renderer. Returns the number of commands applied.
pub fn drive<R: BufRead>(
    input: R,
    controls: &ControlHandle,
    proxy: Option<&RendererProxy>,
    mut output: impl FnMut(&str),
) -> io::Result<usize> {
    let mut applied = 0;
    for line in input.lines() {
        let line = line?;
        match ControlCommand::parse(&line) {
            Ok(Some(command)) => {
                output(&command.apply(controls));
                applied += 1;
                if let Some(proxy) = proxy {
                    if !proxy.request_redraw() {
                        break;
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(input = %line, error = %err, "ignoring control command");
                output(&format!("error: {err}"));
            }
        }
    }
    Ok(applied)
}

pub fn spawn_stdin_reader(controls: ControlHandle, proxy: RendererProxy) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("shadechain-stdin".into())
        .spawn(move || {
            let stdin = io::stdin();
            match drive(stdin.lock(), &controls, Some(&proxy), |line| println!("{line}")) {
                Ok(applied) => tracing::debug!(applied, "stdin control closed"),
                Err(err) => tracing::warn!(error = %err, "stdin control failed"),
            }
        })
        .map_err(|err| anyhow!("failed to spawn stdin control thread: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_every_verb() {
        assert_eq!(
            ControlCommand::parse("load shaders/my plasma.frag"),
            Ok(Some(ControlCommand::Load(PathBuf::from("shaders/my plasma.frag"))))
        );
        assert_eq!(
            ControlCommand::parse("on 2"),
            Ok(Some(ControlCommand::Activate(2, true)))
        );
        assert_eq!(
            ControlCommand::parse("OFF 0"),
            Ok(Some(ControlCommand::Activate(0, false)))
        );
        assert_eq!(
            ControlCommand::parse("toggle 5"),
            Ok(Some(ControlCommand::Toggle(5)))
        );
        assert_eq!(
            ControlCommand::parse("value 1 0.75"),
            Ok(Some(ControlCommand::Value(1, 0.75)))
        );
        assert_eq!(ControlCommand::parse("status"), Ok(Some(ControlCommand::Status)));
        assert_eq!(ControlCommand::parse("reinit"), Ok(Some(ControlCommand::Reinit)));
        assert_eq!(ControlCommand::parse("   "), Ok(None));
        assert_eq!(ControlCommand::parse("# comment"), Ok(None));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(ControlCommand::parse("on").is_err());
        assert!(ControlCommand::parse("on 6").is_err());
        assert!(ControlCommand::parse("value 1").is_err());
        assert!(ControlCommand::parse("value 1 NaN").is_err());
        assert!(ControlCommand::parse("load").is_err());
        assert!(ControlCommand::parse("explode").is_err());
    }

    #[test]
    fn drive_applies_commands_in_order() {
        let controls = ControlHandle::new();
        let script = "on 1\nvalue 1 2.5\nbogus\ntoggle 3\nload /tmp/a.frag\nreinit\n";
        let mut lines = Vec::new();
        let applied = drive(Cursor::new(script), &controls, None, |line| {
            lines.push(line.to_string())
        })
        .unwrap();

        assert_eq!(applied, 5);
        assert!(controls.slot_active(1));
        assert_eq!(controls.slot_value(1), 1.0);
        assert!(controls.slot_active(3));
        assert_eq!(lines[0], "slot 1 on");
        assert_eq!(lines[1], "slot 1 value 1.000");
        assert!(lines[2].starts_with("error: unknown command"));
        assert_eq!(lines[4], "loading /tmp/a.frag");
        assert_eq!(
            controls.snapshot().pending_main,
            Some(PathBuf::from("/tmp/a.frag"))
        );
    }

    #[test]
    fn status_lists_every_slot() {
        let controls = ControlHandle::new();
        controls.set_slot_active(4, true);
        let status = render_status(&controls);
        assert!(status.starts_with("main: (fallback)"));
        assert_eq!(status.lines().filter(|line| line.starts_with("slot ")).count(), NODE_COUNT);
        assert!(status.contains("slot 4: on"));
    }
}
