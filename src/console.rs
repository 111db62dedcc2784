//! Line commands for the operator console.
//!
//! Every command maps onto one public coordinator operation.

use crate::coordinator::diagnostics::{candidate_plan, full_sweep};
use crate::coordinator::error::BedError;
use crate::coordinator::{Coordinator, DeviceUpdate};
use crate::domain::models::{Axis, Direction, MacAddress, Pin, PinValidation, Section};
use crate::infrastructure::bluetooth::protocol::{to_hex, DiagnosticFamily};

pub const HELP: &str = "\
status                               show bed state
move <head|feet|both> <0-100>        move to a position
zero                                 flatten the bed
hold <head|feet|both> <up|down>      move until `release`
release                              end a hold
stop                                 stop everything
calibrate <head|feet|stop>           start or finish a calibration run
light <on|off> [permanent]           light control
pin <digits>                         change the bed's PIN
check-pin <digits>                   test a PIN without storing it
name <name> | nickname <text|->      rename the bed
address <mac>                        set the bed address
calibration <head|feet> <secs>       set a calibration constant by hand
raw <short|72> <hex opcode>          send one diagnostic frame
scan [short|72|stop]                 diagnostic scan (candidates or full sweep)
discoverable | soft-reset | reset-address
quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Help,
    Status,
    Move(Section, f64),
    Zero,
    Hold(Section, Direction),
    Release,
    Stop,
    Calibrate(Axis),
    CalibrateStop,
    Light { on: bool, permanent: bool },
    SetPin(String),
    CheckPin(String),
    Update(DeviceUpdateCommand),
    Raw(DiagnosticFamily, u8),
    Scan(Option<DiagnosticFamily>),
    ScanStop,
    Discoverable,
    SoftReset,
    ResetAddress,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceUpdateCommand {
    Name(String),
    Nickname(String),
    Address(MacAddress),
    Calibration(Axis, f64),
}

fn parse_section(word: Option<&str>) -> Result<Section, String> {
    match word {
        Some("head") => Ok(Section::Head),
        Some("feet") => Ok(Section::Feet),
        Some("both") => Ok(Section::Both),
        other => Err(format!("expected head, feet or both, got {other:?}")),
    }
}

fn parse_axis(word: Option<&str>) -> Result<Axis, String> {
    match word {
        Some("head") => Ok(Axis::Head),
        Some("feet") => Ok(Axis::Feet),
        other => Err(format!("expected head or feet, got {other:?}")),
    }
}

fn parse_number(word: Option<&str>) -> Result<f64, String> {
    let word = word.ok_or("missing number")?;
    word.parse::<f64>()
        .map_err(|_| format!("not a number: {word}"))
}

fn parse_opcode(word: Option<&str>) -> Result<u8, String> {
    let word = word.ok_or("missing opcode")?;
    let digits = word.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|_| format!("not a hex byte: {word}"))
}

fn rest(words: &[&str]) -> Result<String, String> {
    if words.is_empty() {
        Err("missing argument".to_string())
    } else {
        Ok(words.join(" "))
    }
}

pub fn parse(line: &str) -> Result<ConsoleCommand, String> {
    let lowered = line.trim().to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    // Names keep their original case
    let original: Vec<&str> = line.split_whitespace().collect();

    let command = match words.as_slice() {
        [] | ["help"] => ConsoleCommand::Help,
        ["status"] => ConsoleCommand::Status,
        ["move", args @ ..] => ConsoleCommand::Move(
            parse_section(args.first().copied())?,
            parse_number(args.get(1).copied())?,
        ),
        ["zero"] => ConsoleCommand::Zero,
        ["hold", args @ ..] => {
            let section = parse_section(args.first().copied())?;
            let direction = match args.get(1).copied() {
                Some("up") => Direction::Up,
                Some("down") => Direction::Down,
                other => return Err(format!("expected up or down, got {other:?}")),
            };
            ConsoleCommand::Hold(section, direction)
        }
        ["release"] => ConsoleCommand::Release,
        ["stop"] => ConsoleCommand::Stop,
        ["calibrate", "stop"] => ConsoleCommand::CalibrateStop,
        ["calibrate", axis] => ConsoleCommand::Calibrate(parse_axis(Some(*axis))?),
        ["light", state, extra @ ..] => {
            let on = match *state {
                "on" => true,
                "off" => false,
                other => return Err(format!("expected on or off, got {other}")),
            };
            ConsoleCommand::Light {
                on,
                permanent: extra.first() == Some(&"permanent"),
            }
        }
        ["pin", digits] => ConsoleCommand::SetPin(digits.to_string()),
        ["check-pin", digits] => ConsoleCommand::CheckPin(digits.to_string()),
        ["name", ..] => ConsoleCommand::Update(DeviceUpdateCommand::Name(rest(&original[1..])?)),
        ["nickname", ..] => {
            let nickname = rest(&original[1..])?;
            let nickname = if nickname == "-" { String::new() } else { nickname };
            ConsoleCommand::Update(DeviceUpdateCommand::Nickname(nickname))
        }
        ["address", mac] => ConsoleCommand::Update(DeviceUpdateCommand::Address(
            mac.parse::<MacAddress>().map_err(|e| e.to_string())?,
        )),
        ["calibration", args @ ..] => ConsoleCommand::Update(DeviceUpdateCommand::Calibration(
            parse_axis(args.first().copied())?,
            parse_number(args.get(1).copied())?,
        )),
        ["raw", family, opcode] => ConsoleCommand::Raw(
            family.parse::<DiagnosticFamily>()?,
            parse_opcode(Some(*opcode))?,
        ),
        ["scan"] => ConsoleCommand::Scan(None),
        ["scan", "stop"] => ConsoleCommand::ScanStop,
        ["scan", family] => ConsoleCommand::Scan(Some(family.parse::<DiagnosticFamily>()?)),
        ["discoverable"] => ConsoleCommand::Discoverable,
        ["soft-reset"] => ConsoleCommand::SoftReset,
        ["reset-address"] => ConsoleCommand::ResetAddress,
        ["quit"] | ["exit"] => ConsoleCommand::Quit,
        _ => return Err(format!("unknown command: {}", line.trim())),
    };
    Ok(command)
}

fn status(coordinator: &Coordinator) -> String {
    let snapshot = coordinator.snapshot();
    let mut lines = vec![
        format!("{} [{}]", snapshot.title, snapshot.connection),
        format!(
            "head {:.1}%  feet {:.1}%  light {}",
            snapshot.head_position,
            snapshot.feet_position,
            if snapshot.light_on { "on" } else { "off" }
        ),
    ];
    if let Some(address) = snapshot.address {
        lines.push(format!("address {address}"));
    }
    if let Some(outcome) = snapshot.last_auth {
        lines.push(format!("last auth {outcome:?}"));
    }
    if snapshot.movement_active {
        lines.push("moving".to_string());
    }
    let reference = coordinator.calibration_constant();
    if let Some(progress) = coordinator
        .calibration_progress(reference.duration(Axis::Head).max(reference.duration(Axis::Feet)))
    {
        lines.push(format!(
            "calibrating {} for {:.1}s",
            progress.axis,
            progress.elapsed.as_secs_f64()
        ));
    }
    let diagnostics = coordinator.diagnostic_status();
    if diagnostics.running || diagnostics.sent > 0 {
        lines.push(format!(
            "scan {} sent {}",
            if diagnostics.running { "running," } else { "done," },
            diagnostics.sent
        ));
    }
    if let Some(bytes) = snapshot.last_notification {
        lines.push(format!("last notification {}", to_hex(&bytes)));
    }
    lines.join("\n")
}

/// Run one command and describe the result. `Quit` is left to the caller.
pub async fn execute(coordinator: &Coordinator, command: ConsoleCommand) -> Result<String, BedError> {
    let reply = match command {
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Status => status(coordinator),
        ConsoleCommand::Move(section, target) => {
            coordinator.move_to(section, target).await?;
            format!("{section} at {target:.0}%")
        }
        ConsoleCommand::Zero => {
            coordinator.move_to_zero().await?;
            "flat".to_string()
        }
        ConsoleCommand::Hold(section, direction) => {
            coordinator.start_hold(section, direction).await?;
            format!("{section} moving {direction:?}, `release` to stop")
        }
        ConsoleCommand::Release => {
            coordinator.stop_hold().await;
            "released".to_string()
        }
        ConsoleCommand::Stop => {
            coordinator.stop_all().await?;
            "stopped".to_string()
        }
        ConsoleCommand::Calibrate(axis) => {
            coordinator.start_calibration(axis).await?;
            format!("calibrating {axis}; run `calibrate stop` when it reaches the top")
        }
        ConsoleCommand::CalibrateStop => {
            let secs = coordinator.stop_calibration().await?;
            format!("measured {secs:.1}s, returning to flat")
        }
        ConsoleCommand::Light { on, permanent } => {
            coordinator.set_light(on, permanent).await?;
            format!("light {}", if on { "on" } else { "off" })
        }
        ConsoleCommand::SetPin(digits) => {
            coordinator.set_pin(&digits).await?;
            "PIN changed".to_string()
        }
        ConsoleCommand::CheckPin(digits) => match coordinator.validate_pin(&digits).await {
            PinValidation::Valid => format!("PIN {} accepted", Pin::normalize(&digits)),
            PinValidation::WrongPin => "wrong PIN".to_string(),
            PinValidation::NoPinCheck => "bed does not check PINs".to_string(),
            PinValidation::ConnectionFailed => "could not reach the bed".to_string(),
        },
        ConsoleCommand::Update(update) => {
            let mut request = DeviceUpdate::default();
            match update {
                DeviceUpdateCommand::Name(name) => request.name = Some(name),
                DeviceUpdateCommand::Nickname(nickname) => request.nickname = Some(nickname),
                DeviceUpdateCommand::Address(address) => request.address = Some(address),
                DeviceUpdateCommand::Calibration(Axis::Head, secs) => {
                    request.head_calibration_secs = Some(secs)
                }
                DeviceUpdateCommand::Calibration(Axis::Feet, secs) => {
                    request.feet_calibration_secs = Some(secs)
                }
            }
            coordinator.reconfigure(request);
            "saved".to_string()
        }
        ConsoleCommand::Raw(family, opcode) => {
            match coordinator.send_diagnostic(family, opcode).await? {
                Some(bytes) => format!("reply {}", to_hex(&bytes)),
                None => "no reply".to_string(),
            }
        }
        ConsoleCommand::Scan(family) => {
            let plan = match family {
                Some(family) => full_sweep(family),
                None => candidate_plan(),
            };
            let frames = plan.len();
            coordinator.start_diagnostic_scan(plan).await;
            format!("scanning {frames} frames")
        }
        ConsoleCommand::ScanStop => {
            coordinator.stop_diagnostic_scan().await;
            "scan stopped".to_string()
        }
        ConsoleCommand::Discoverable => {
            coordinator.make_discoverable().await?;
            "bed is discoverable".to_string()
        }
        ConsoleCommand::SoftReset => {
            coordinator.soft_reset().await?;
            "reset sent".to_string()
        }
        ConsoleCommand::ResetAddress => match coordinator.reset_address().await {
            Some(address) => format!("found {address}"),
            None => "bed not found yet".to_string(),
        },
        ConsoleCommand::Quit => String::new(),
    };
    Ok(reply)
}
