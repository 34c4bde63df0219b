//! Backend handshake: `select` → `args` → size/capabilities/`connect`.
//!
//! Flow:
//! 1. Gateway sends `select,<protocol>`
//! 2. Daemon replies `args,<name>,<name>,...`
//! 3. Gateway sends `size`, `audio`, `video`, `image`, then `connect` with one
//!    value per requested name, in the requested order

use rdgate_core::{GatewayError, GatewayResult, Instruction, Settings};

/// Attribute names with this prefix announce a protocol version and are
/// answered by echoing them back.
pub const VERSION_PREFIX: &str = "VERSION_";

const DEFAULT_WIDTH: &str = "1024";
const DEFAULT_HEIGHT: &str = "768";
const DEFAULT_DPI: &str = "96";

/// The opening instruction naming the backend protocol.
pub fn select(connection_type: &str) -> Instruction {
    Instruction::new("select", [connection_type])
}

/// Build the full reply to the daemon's `args` instruction.
///
/// Fails with `BackendProtocol` if `request` is not an `args` instruction.
pub fn reply(request: &Instruction, settings: &Settings) -> GatewayResult<Vec<Instruction>> {
    if request.opcode != "args" {
        return Err(GatewayError::BackendProtocol(format!(
            "expected args instruction, got {:?}",
            request.opcode
        )));
    }

    let size = Instruction::new(
        "size",
        [
            setting_or(settings, "width", DEFAULT_WIDTH),
            setting_or(settings, "height", DEFAULT_HEIGHT),
            setting_or(settings, "dpi", DEFAULT_DPI),
        ],
    );

    let connect = Instruction::new(
        "connect",
        request.args.iter().map(|name| attribute_value(settings, name)),
    );

    Ok(vec![
        size,
        capabilities(settings, "audio"),
        capabilities(settings, "video"),
        capabilities(settings, "image"),
        connect,
    ])
}

/// Resolve one requested attribute. The name is tried as given, then with
/// `-` replaced by `_`. Missing attributes resolve to the empty string.
fn attribute_value(settings: &Settings, name: &str) -> String {
    if name.starts_with(VERSION_PREFIX) {
        return name.to_string();
    }
    settings
        .get(name)
        .or_else(|| settings.get(&name.replace('-', "_")))
        .map(|v| v.as_wire().into_owned())
        .unwrap_or_default()
}

fn setting_or(settings: &Settings, name: &str, default: &str) -> String {
    settings
        .get(name)
        .map(|v| v.as_wire().into_owned())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn capabilities(settings: &Settings, opcode: &str) -> Instruction {
    let mimetypes = settings.get(opcode).map(|v| v.as_list()).unwrap_or_default();
    Instruction::new(opcode, mimetypes)
}
