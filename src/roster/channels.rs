/* Naming vocabulary of the channels a meter can deliver, used for logging and Home Assistant */

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub code: String,
    pub note: String,
    pub unit: &'static str,
    pub device_class: &'static str,
    pub state_class: &'static str,
}

fn phase(i: u32) -> String {
    match i {
        0 => "all phases".to_string(),
        _ => format!("phase {i}"),
    }
}

fn describe_energy(code: &str) -> Option<ChannelInfo> {
    let base = code.get(..3)?;
    let rest = &code[3..];
    let (name, unit, device_class) = match base {
        "EAP" => ("Energy A+", "kWh", "energy"),
        "EAM" => ("Energy A-", "kWh", "energy"),
        "ERP" => ("Energy R+", "kvarh", "reactive_energy"),
        "ERM" => ("Energy R-", "kvarh", "reactive_energy"),
        _ => return None,
    };

    let (period, tariff) = match rest.strip_prefix('S') {
        Some(t) => ("daily", t),
        None => match rest.strip_prefix('X') {
            Some(t) => ("at month start", t),
            None => ("total", rest),
        },
    };

    let tariff = match tariff {
        "" => String::new(),
        t => {
            let n: u32 = t.strip_prefix('T')?.parse().ok()?;
            format!(" tariff {n}")
        }
    };

    Some(ChannelInfo {
        code: code.to_string(),
        note: format!("{name} {period}{tariff}"),
        unit,
        device_class,
        state_class: "total_increasing",
    })
}

pub fn describe(code: &str) -> Option<ChannelInfo> {
    if code.starts_with('E') {
        return describe_energy(code);
    }

    if code == "f" {
        return Some(ChannelInfo {
            code: code.to_string(),
            note: "Grid frequency".to_string(),
            unit: "Hz",
            device_class: "frequency",
            state_class: "measurement",
        });
    }

    let mut chars = code.chars();
    let family = chars.next()?;
    let idx: u32 = chars.as_str().parse().ok()?;

    let (name, unit, device_class, phases) = match family {
        'P' => ("Active power", "kW", "power", 0..=3),
        'Q' => ("Reactive power", "kvar", "reactive_power", 0..=3),
        'S' => ("Apparent power", "kVA", "apparent_power", 0..=3),
        'I' => ("Current", "A", "current", 1..=3),
        'U' => ("Phase voltage", "V", "voltage", 1..=3),
        _ => return None,
    };

    if !phases.contains(&idx) {
        return None;
    }

    Some(ChannelInfo {
        code: code.to_string(),
        note: format!("{name} {}", phase(idx)),
        unit,
        device_class,
        state_class: "measurement",
    })
}
