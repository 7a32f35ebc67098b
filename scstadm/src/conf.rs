use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::model::{
    Attrs, Device, DeviceGroup, Driver, Handler, IniGroup, Lun, ScstConfig, Target, TargetGroup,
    TgtRef,
};
use crate::ScstError;

/// Parses a configuration file into the declared-state model.
pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<ScstConfig> {
    let path_ref = path.as_ref();
    let text = fs::read_to_string(path_ref)?;
    parse_str(&text, &path_ref.to_string_lossy())
}

/// Parses configuration text into the declared-state model.
///
/// ```no_run
/// use scstadm::parse_str;
///
/// # fn main() -> anyhow::Result<()> {
/// let cfg = parse_str(
///     "HANDLER vdisk_fileio { DEVICE d1 { filename /v/d1.img } }",
///     "inline",
/// )?;
/// # Ok(())
/// # }
/// ```
pub fn parse_str(text: &str, origin: &str) -> Result<ScstConfig> {
    let mut parser = Parser::new(text, origin)?;
    let mut cfg = ScstConfig::default();
    parser.parse_root(&mut cfg)?;
    Ok(cfg)
}

#[derive(Debug, Clone)]
struct Tok {
    line: usize,
    col: usize,
    text: String,
}

struct Parser {
    origin: String,
    raw: Vec<String>,
    stripped: Vec<String>,
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn new(text: &str, origin: &str) -> Result<Self> {
        let raw: Vec<String> = text.lines().map(|l| l.to_string()).collect();
        let mut stripped = Vec::with_capacity(raw.len());
        let mut toks = Vec::new();

        for (idx, line) in raw.iter().enumerate() {
            let lineno = idx + 1;
            let cut = strip_comment(line);
            lex_line(&cut, lineno, &mut toks).map_err(|(col, msg)| {
                parse_err(origin, &raw, lineno, col, msg)
            })?;
            stripped.push(cut);
        }

        Ok(Parser {
            origin: origin.to_string(),
            raw,
            stripped,
            toks,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Tok {
        let t = self.toks[self.pos].clone();
        self.pos += 1;
        t
    }

    fn err(&self, line: usize, col: usize, msg: impl Into<String>) -> anyhow::Error {
        parse_err(&self.origin, &self.raw, line, col, msg.into())
    }

    fn take_name(&mut self, what: &str) -> Result<Tok> {
        match self.peek().cloned() {
            Some(t) if t.text != "{" && t.text != "}" => {
                self.bump();
                Ok(Tok {
                    text: unquote(&t.text).to_string(),
                    ..t
                })
            }
            Some(t) => Err(self.err(t.line, t.col, format!("expected {}", what))),
            None => Err(self.err(self.raw.len().max(1), 0, format!("expected {}", what))),
        }
    }

    fn open_brace(&mut self) -> Result<Tok> {
        match self.peek().cloned() {
            Some(t) if t.text == "{" => {
                self.bump();
                Ok(t)
            }
            Some(t) => Err(self.err(t.line, t.col, "expected '{'")),
            None => Err(self.err(self.raw.len().max(1), 0, "expected '{'")),
        }
    }

    fn at_open(&self) -> bool {
        matches!(self.peek(), Some(t) if t.text == "{")
    }

    /// Consumes the remainder of `key`'s line up to any brace and returns
    /// it as an attribute value: interior whitespace kept, one surrounding
    /// quote pair stripped.
    fn value_rest(&mut self, key: &Tok) -> String {
        let line = key.line;
        let mut start: Option<usize> = None;
        let mut end = self.stripped[line - 1].len();

        while let Some(t) = self.peek() {
            if t.line != line {
                break;
            }
            if t.text == "{" || t.text == "}" {
                end = t.col;
                break;
            }
            if start.is_none() {
                start = Some(t.col);
            }
            self.bump();
        }

        match start {
            None => String::new(),
            Some(s) => unquote(self.stripped[line - 1][s..end].trim()).to_string(),
        }
    }

    fn put_attr(&self, attrs: &mut Attrs, key: &Tok, value: &str) {
        if attrs.contains(&key.text) {
            warn!(
                "{}:{}: duplicate attribute '{}' overrides earlier value",
                self.origin, key.line, key.text
            );
        }
        attrs.insert(key.text.as_str(), value);
    }

    fn parse_enabled(&mut self, key: &Tok) -> Result<bool> {
        let value = self.value_rest(key);
        match value.as_str() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(self.err(
                key.line,
                key.col,
                format!("invalid enabled value '{}', expected 0 or 1", other),
            )),
        }
    }

    fn parse_root(&mut self, cfg: &mut ScstConfig) -> Result<()> {
        while let Some(t) = self.peek().cloned() {
            match t.text.as_str() {
                "}" => return Err(self.err(t.line, t.col, "unexpected '}'")),
                "{" => return Err(self.err(t.line, t.col, "unexpected '{'")),
                "HANDLER" => {
                    self.bump();
                    let name = self.take_name("handler name")?;
                    let open = self.open_brace()?;
                    if cfg.handlers.contains_key(&name.text) {
                        return Err(self.err(
                            name.line,
                            name.col,
                            format!("duplicate HANDLER '{}'", name.text),
                        ));
                    }
                    let handler = self.parse_handler(&name.text, &open)?;
                    cfg.handlers.insert(name.text, handler);
                }
                "TARGET_DRIVER" => {
                    self.bump();
                    let name = self.take_name("driver name")?;
                    let open = self.open_brace()?;
                    if cfg.drivers.contains_key(&name.text) {
                        return Err(self.err(
                            name.line,
                            name.col,
                            format!("duplicate TARGET_DRIVER '{}'", name.text),
                        ));
                    }
                    let driver = self.parse_driver(&name.text, &open)?;
                    cfg.drivers.insert(name.text, driver);
                }
                "DEVICE_GROUP" => {
                    self.bump();
                    let name = self.take_name("device group name")?;
                    let open = self.open_brace()?;
                    if cfg.device_groups.contains_key(&name.text) {
                        return Err(self.err(
                            name.line,
                            name.col,
                            format!("duplicate DEVICE_GROUP '{}'", name.text),
                        ));
                    }
                    let dg = self.parse_device_group(&name.text, &open)?;
                    cfg.device_groups.insert(name.text, dg);
                }
                _ => {
                    self.bump();
                    let value = self.value_rest(&t);
                    self.put_attr(&mut cfg.attributes, &t, &value);
                }
            }
        }
        Ok(())
    }

    fn parse_handler(&mut self, name: &str, open: &Tok) -> Result<Handler> {
        let mut handler = Handler {
            name: name.to_string(),
            ..Default::default()
        };

        loop {
            match self.peek().cloned() {
                None => return Err(self.err(open.line, open.col, "unclosed '{'")),
                Some(t) if t.text == "}" => {
                    self.bump();
                    return Ok(handler);
                }
                Some(t) if t.text == "{" => {
                    return Err(self.err(t.line, t.col, "unexpected '{'"))
                }
                Some(t) if t.text == "DEVICE" => {
                    self.bump();
                    let dev_name = self.take_name("device name")?;
                    if handler.devices.contains_key(&dev_name.text) {
                        return Err(self.err(
                            dev_name.line,
                            dev_name.col,
                            format!("duplicate DEVICE '{}'", dev_name.text),
                        ));
                    }
                    let mut device = Device {
                        name: dev_name.text.clone(),
                        handler: name.to_string(),
                        ..Default::default()
                    };
                    if self.at_open() {
                        let open = self.bump();
                        self.parse_attr_block(&open, &mut device.attributes)?;
                    }
                    handler.devices.insert(dev_name.text, device);
                }
                Some(t) => {
                    self.bump();
                    let value = self.value_rest(&t);
                    self.put_attr(&mut handler.attributes, &t, &value);
                }
            }
        }
    }

    fn parse_driver(&mut self, name: &str, open: &Tok) -> Result<Driver> {
        let mut driver = Driver {
            name: name.to_string(),
            ..Default::default()
        };

        loop {
            match self.peek().cloned() {
                None => return Err(self.err(open.line, open.col, "unclosed '{'")),
                Some(t) if t.text == "}" => {
                    self.bump();
                    return Ok(driver);
                }
                Some(t) if t.text == "{" => {
                    return Err(self.err(t.line, t.col, "unexpected '{'"))
                }
                Some(t) if t.text == "TARGET" => {
                    self.bump();
                    let tgt_name = self.take_name("target name")?;
                    if driver.targets.contains_key(&tgt_name.text) {
                        return Err(self.err(
                            tgt_name.line,
                            tgt_name.col,
                            format!("duplicate TARGET '{}'", tgt_name.text),
                        ));
                    }
                    let target = if self.at_open() {
                        let open = self.bump();
                        self.parse_target(&tgt_name.text, &open)?
                    } else {
                        Target {
                            name: tgt_name.text.clone(),
                            ..Default::default()
                        }
                    };
                    driver.targets.insert(tgt_name.text, target);
                }
                Some(t) if t.text == "enabled" => {
                    self.bump();
                    driver.enabled = Some(self.parse_enabled(&t)?);
                }
                Some(t) => {
                    self.bump();
                    let value = self.value_rest(&t);
                    self.put_attr(&mut driver.attributes, &t, &value);
                }
            }
        }
    }

    fn parse_target(&mut self, name: &str, open: &Tok) -> Result<Target> {
        let mut target = Target {
            name: name.to_string(),
            ..Default::default()
        };

        loop {
            match self.peek().cloned() {
                None => return Err(self.err(open.line, open.col, "unclosed '{'")),
                Some(t) if t.text == "}" => {
                    self.bump();
                    return Ok(target);
                }
                Some(t) if t.text == "{" => {
                    return Err(self.err(t.line, t.col, "unexpected '{'"))
                }
                Some(t) if t.text == "LUN" => {
                    let lun = self.parse_lun_line()?;
                    if target.luns.contains_key(&lun.id) {
                        return Err(self.err(
                            t.line,
                            t.col,
                            format!("duplicate LUN {}", lun.id),
                        ));
                    }
                    target.luns.insert(lun.id, lun);
                }
                Some(t) if t.text == "GROUP" => {
                    self.bump();
                    let grp_name = self.take_name("group name")?;
                    let open = self.open_brace()?;
                    if target.ini_groups.contains_key(&grp_name.text) {
                        return Err(self.err(
                            grp_name.line,
                            grp_name.col,
                            format!("duplicate GROUP '{}'", grp_name.text),
                        ));
                    }
                    let group = self.parse_ini_group(&grp_name.text, &open)?;
                    target.ini_groups.insert(grp_name.text, group);
                }
                Some(t) if t.text == "enabled" => {
                    self.bump();
                    target.enabled = Some(self.parse_enabled(&t)?);
                }
                Some(t) => {
                    self.bump();
                    let value = self.value_rest(&t);
                    self.put_attr(&mut target.attributes, &t, &value);
                }
            }
        }
    }

    fn parse_ini_group(&mut self, name: &str, open: &Tok) -> Result<IniGroup> {
        let mut group = IniGroup {
            name: name.to_string(),
            ..Default::default()
        };

        loop {
            match self.peek().cloned() {
                None => return Err(self.err(open.line, open.col, "unclosed '{'")),
                Some(t) if t.text == "}" => {
                    self.bump();
                    return Ok(group);
                }
                Some(t) if t.text == "{" => {
                    return Err(self.err(t.line, t.col, "unexpected '{'"))
                }
                Some(t) if t.text == "LUN" => {
                    let lun = self.parse_lun_line()?;
                    if group.luns.contains_key(&lun.id) {
                        return Err(self.err(
                            t.line,
                            t.col,
                            format!("duplicate LUN {}", lun.id),
                        ));
                    }
                    group.luns.insert(lun.id, lun);
                }
                Some(t) if t.text == "INITIATOR" => {
                    self.bump();
                    let ini = self.take_name("initiator name")?;
                    if group.initiators.contains(&ini.text) {
                        return Err(self.err(
                            ini.line,
                            ini.col,
                            format!("duplicate INITIATOR '{}'", ini.text),
                        ));
                    }
                    group.initiators.push(ini.text);
                }
                Some(t) => {
                    self.bump();
                    let value = self.value_rest(&t);
                    self.put_attr(&mut group.attributes, &t, &value);
                }
            }
        }
    }

    fn parse_lun_line(&mut self) -> Result<Lun> {
        let kw = self.bump();
        let id_tok = self.take_name("LUN number")?;
        let id = id_tok.text.parse::<u64>().map_err(|_| {
            self.err(
                id_tok.line,
                id_tok.col,
                format!("invalid LUN number '{}'", id_tok.text),
            )
        })?;
        let dev = self.take_name("device name")?;

        let mut lun = Lun {
            id,
            device: dev.text,
            ..Default::default()
        };

        // attr=value assignments up to end of line or a brace
        while let Some(t) = self.peek().cloned() {
            if t.line != kw.line || t.text == "{" || t.text == "}" {
                break;
            }
            self.bump();
            let (k, v) = t.text.split_once('=').ok_or_else(|| {
                self.err(
                    t.line,
                    t.col,
                    format!("expected attr=value, got '{}'", t.text),
                )
            })?;
            lun.attributes.insert(k, unquote(v));
        }

        Ok(lun)
    }

    fn parse_device_group(&mut self, name: &str, open: &Tok) -> Result<DeviceGroup> {
        let mut dg = DeviceGroup {
            name: name.to_string(),
            ..Default::default()
        };

        loop {
            match self.peek().cloned() {
                None => return Err(self.err(open.line, open.col, "unclosed '{'")),
                Some(t) if t.text == "}" => {
                    self.bump();
                    return Ok(dg);
                }
                Some(t) if t.text == "DEVICE" => {
                    self.bump();
                    let dev = self.take_name("device name")?;
                    if dg.devices.contains(&dev.text) {
                        return Err(self.err(
                            dev.line,
                            dev.col,
                            format!("duplicate DEVICE '{}'", dev.text),
                        ));
                    }
                    dg.devices.push(dev.text);
                }
                Some(t) if t.text == "TARGET_GROUP" => {
                    self.bump();
                    let tg_name = self.take_name("target group name")?;
                    let open = self.open_brace()?;
                    if dg.target_groups.contains_key(&tg_name.text) {
                        return Err(self.err(
                            tg_name.line,
                            tg_name.col,
                            format!("duplicate TARGET_GROUP '{}'", tg_name.text),
                        ));
                    }
                    let tg = self.parse_target_group(&tg_name.text, &open)?;
                    dg.target_groups.insert(tg_name.text, tg);
                }
                Some(t) => {
                    return Err(self.err(
                        t.line,
                        t.col,
                        format!("unexpected '{}' in DEVICE_GROUP", t.text),
                    ))
                }
            }
        }
    }

    fn parse_target_group(&mut self, name: &str, open: &Tok) -> Result<TargetGroup> {
        let mut tg = TargetGroup {
            name: name.to_string(),
            ..Default::default()
        };

        loop {
            match self.peek().cloned() {
                None => return Err(self.err(open.line, open.col, "unclosed '{'")),
                Some(t) if t.text == "}" => {
                    self.bump();
                    return Ok(tg);
                }
                Some(t) if t.text == "{" => {
                    return Err(self.err(t.line, t.col, "unexpected '{'"))
                }
                Some(t) if t.text == "TARGET" => {
                    self.bump();
                    let tgt = self.take_name("target name")?;
                    if tg.targets.contains_key(&tgt.text) {
                        return Err(self.err(
                            tgt.line,
                            tgt.col,
                            format!("duplicate TARGET '{}'", tgt.text),
                        ));
                    }
                    let mut tref = TgtRef {
                        name: tgt.text.clone(),
                        ..Default::default()
                    };
                    if self.at_open() {
                        let open = self.bump();
                        self.parse_attr_block(&open, &mut tref.attributes)?;
                    }
                    tg.targets.insert(tgt.text, tref);
                }
                Some(t) => {
                    self.bump();
                    let value = self.value_rest(&t);
                    self.put_attr(&mut tg.attributes, &t, &value);
                }
            }
        }
    }

    /// Body of attribute-only blocks (devices, target-group members).
    fn parse_attr_block(&mut self, open: &Tok, attrs: &mut Attrs) -> Result<()> {
        loop {
            match self.peek().cloned() {
                None => return Err(self.err(open.line, open.col, "unclosed '{'")),
                Some(t) if t.text == "}" => {
                    self.bump();
                    return Ok(());
                }
                Some(t) if t.text == "{" => {
                    return Err(self.err(t.line, t.col, "unexpected '{'"))
                }
                Some(t) => {
                    self.bump();
                    let value = self.value_rest(&t);
                    self.put_attr(attrs, &t, &value);
                }
            }
        }
    }
}

fn parse_err(
    origin: &str,
    raw: &[String],
    line: usize,
    col: usize,
    msg: String,
) -> anyhow::Error {
    let excerpt = raw
        .get(line.saturating_sub(1))
        .map(|l| l.trim().to_string())
        .unwrap_or_default();
    anyhow::Error::new(ScstError::Parse {
        file: origin.to_string(),
        line,
        col: col + 1,
        msg,
        excerpt,
    })
}

/// Cuts an unquoted `#` comment off the line; a `#` between double quotes
/// is literal.
fn strip_comment(line: &str) -> String {
    let mut in_quote = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '#' if !in_quote => return line[..i].to_string(),
            _ => {}
        }
    }
    line.to_string()
}

fn lex_line(line: &str, lineno: usize, toks: &mut Vec<Tok>) -> std::result::Result<(), (usize, String)> {
    let mut chars = line.char_indices().peekable();

    while let Some(&(i, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '{' || c == '}' {
            chars.next();
            toks.push(Tok {
                line: lineno,
                col: i,
                text: c.to_string(),
            });
            continue;
        }

        let start = i;
        let mut end = line.len();
        let mut in_quote = false;
        let mut quote_col = 0;
        while let Some(&(j, d)) = chars.peek() {
            if d == '"' {
                in_quote = !in_quote;
                quote_col = j;
            } else if !in_quote && (d.is_whitespace() || d == '{' || d == '}') {
                end = j;
                break;
            }
            chars.next();
        }
        if in_quote {
            return Err((quote_col, "unterminated quote".to_string()));
        }
        if chars.peek().is_none() {
            end = line.len();
        }
        toks.push(Tok {
            line: lineno,
            col: start,
            text: line[start..end].to_string(),
        });
    }

    Ok(())
}

fn unquote(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn fmt_value(v: &str) -> String {
    let needs_quote = v.is_empty()
        || v.contains('#')
        || v.contains('{')
        || v.contains('}')
        || v.starts_with('"')
        || v.trim() != v;
    if needs_quote {
        format!("\"{}\"", v)
    } else {
        v.to_string()
    }
}

fn fmt_lun(lun: &Lun) -> String {
    let mut line = format!("LUN {} {}", lun.id, lun.device);
    for (k, v) in lun.attributes.iter() {
        let v = if v.contains(char::is_whitespace) || v.contains('#') {
            format!("\"{}\"", v)
        } else {
            v.to_string()
        };
        line.push_str(&format!(" {}={}", k, v));
    }
    line
}

fn push_attrs(out: &mut String, indent: &str, attrs: &Attrs) {
    for (k, v) in attrs.iter() {
        out.push_str(&format!("{}{} {}\n", indent, k, fmt_value(v)));
    }
}

/// Renders a model back to configuration text in the same grammar the
/// parser reads, so that written output re-parses to an equal model.
pub fn to_conf_string(cfg: &ScstConfig) -> String {
    let mut out = String::new();

    push_attrs(&mut out, "", &cfg.attributes);

    for handler in cfg.handlers.values() {
        out.push_str(&format!("\nHANDLER {} {{\n", handler.name));
        push_attrs(&mut out, "    ", &handler.attributes);
        for device in handler.devices.values() {
            out.push_str(&format!("    DEVICE {} {{\n", device.name));
            push_attrs(&mut out, "        ", &device.attributes);
            out.push_str("    }\n");
        }
        out.push_str("}\n");
    }

    for driver in cfg.drivers.values() {
        out.push_str(&format!("\nTARGET_DRIVER {} {{\n", driver.name));
        push_attrs(&mut out, "    ", &driver.attributes);
        for target in driver.targets.values() {
            out.push_str(&format!("    TARGET {} {{\n", target.name));
            push_attrs(&mut out, "        ", &target.attributes);
            for lun in target.luns.values() {
                out.push_str(&format!("        {}\n", fmt_lun(lun)));
            }
            for group in target.ini_groups.values() {
                out.push_str(&format!("        GROUP {} {{\n", group.name));
                push_attrs(&mut out, "            ", &group.attributes);
                for ini in &group.initiators {
                    out.push_str(&format!("            INITIATOR {}\n", ini));
                }
                for lun in group.luns.values() {
                    out.push_str(&format!("            {}\n", fmt_lun(lun)));
                }
                out.push_str("        }\n");
            }
            if let Some(enabled) = target.enabled {
                out.push_str(&format!("        enabled {}\n", enabled as u8));
            }
            out.push_str("    }\n");
        }
        if let Some(enabled) = driver.enabled {
            out.push_str(&format!("    enabled {}\n", enabled as u8));
        }
        out.push_str("}\n");
    }

    for dg in cfg.device_groups.values() {
        out.push_str(&format!("\nDEVICE_GROUP {} {{\n", dg.name));
        for device in &dg.devices {
            out.push_str(&format!("    DEVICE {}\n", device));
        }
        for tg in dg.target_groups.values() {
            out.push_str(&format!("    TARGET_GROUP {} {{\n", tg.name));
            push_attrs(&mut out, "        ", &tg.attributes);
            for tref in tg.targets.values() {
                if tref.attributes.is_empty() {
                    out.push_str(&format!("        TARGET {}\n", tref.name));
                } else {
                    out.push_str(&format!("        TARGET {} {{\n", tref.name));
                    push_attrs(&mut out, "            ", &tref.attributes);
                    out.push_str("        }\n");
                }
            }
            out.push_str("    }\n");
        }
        out.push_str("}\n");
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(text: &str) -> Result<ScstConfig> {
        parse_str(text, "test.conf")
    }

    fn parse_error_line(text: &str) -> usize {
        let err = parse(text).unwrap_err();
        match err.downcast_ref::<ScstError>() {
            Some(ScstError::Parse { line, .. }) => *line,
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_full_config() -> Result<()> {
        let cfg = parse(
            r#"
setup_id 0x100

HANDLER vdisk_fileio {
    DEVICE disk01 {
        filename /vault/disk01.img
        nv_cache 1
    }
    DEVICE disk02 {
        filename /vault/disk02.img
    }
}

TARGET_DRIVER iscsi {
    enabled 1
    TARGET iqn.2006-10.net.vlnb:tgt {
        enabled 1
        rel_tgt_id 1
        LUN 0 disk01

        GROUP host_grp {
            INITIATOR iqn.2005-03.org.open-iscsi:cacdcd2520
            LUN 0 disk02 read_only=1
        }
    }
}

DEVICE_GROUP dg1 {
    DEVICE disk01

    TARGET_GROUP controller_A {
        group_id 1
        TARGET iqn.2006-10.net.vlnb:tgt {
            rel_tgt_id 1
        }
    }
}
"#,
        )?;

        assert_eq!(cfg.attributes().get("setup_id"), Some("0x100"));

        let handler = cfg.get_handler("vdisk_fileio")?;
        assert_eq!(handler.devices().len(), 2);
        assert_eq!(
            handler.get_device("disk01")?.attributes().get("filename"),
            Some("/vault/disk01.img")
        );

        let driver = cfg.get_driver("iscsi")?;
        assert_eq!(driver.enabled(), Some(true));
        let target = driver.get_target("iqn.2006-10.net.vlnb:tgt")?;
        assert_eq!(target.enabled(), Some(true));
        assert_eq!(target.attributes().get("rel_tgt_id"), Some("1"));
        assert_eq!(target.get_lun(0).unwrap().device(), "disk01");

        let group = target.get_ini_group("host_grp")?;
        assert_eq!(group.initiators().len(), 1);
        assert_eq!(
            group.luns()[0].attributes().get("read_only"),
            Some("1")
        );

        let dg = &cfg.device_groups()[0];
        assert_eq!(dg.devices(), &["disk01".to_string()]);
        let tg = dg.target_groups()[0];
        assert_eq!(tg.attributes().get("group_id"), Some("1"));
        assert_eq!(
            tg.targets()[0].attributes().get("rel_tgt_id"),
            Some("1")
        );

        Ok(())
    }

    #[test]
    fn test_parse_single_line_blocks() -> Result<()> {
        let cfg = parse("HANDLER vdisk_fileio { DEVICE d1 { filename /v/d1.img } }")?;
        let dev = cfg.get_handler("vdisk_fileio")?.get_device("d1")?;
        assert_eq!(dev.attributes().get("filename"), Some("/v/d1.img"));
        Ok(())
    }

    #[test]
    fn test_value_keeps_interior_whitespace() -> Result<()> {
        let cfg = parse("HANDLER dev_disk { DEVICE d1 { t10_dev_id  my  spaced  id   } }")?;
        let dev = cfg.get_handler("dev_disk")?.get_device("d1")?;
        assert_eq!(dev.attributes().get("t10_dev_id"), Some("my  spaced  id"));
        Ok(())
    }

    #[test]
    fn test_quoted_values() -> Result<()> {
        let cfg = parse(
            "t10_id \"value with # hash\"\nHANDLER vdisk_fileio { DEVICE d1 { filename \"/v/with space.img\" } }",
        )?;
        assert_eq!(cfg.attributes().get("t10_id"), Some("value with # hash"));
        let dev = cfg.get_handler("vdisk_fileio")?.get_device("d1")?;
        assert_eq!(dev.attributes().get("filename"), Some("/v/with space.img"));
        Ok(())
    }

    #[test]
    fn test_exactly_one_quote_pair_stripped() -> Result<()> {
        let cfg = parse("prod_id \"\"quoted\"\"")?;
        assert_eq!(cfg.attributes().get("prod_id"), Some("\"quoted\""));
        Ok(())
    }

    #[test]
    fn test_comment_to_end_of_line() -> Result<()> {
        let cfg = parse("threads 4 # tuned for the lab box\n")?;
        assert_eq!(cfg.attributes().get("threads"), Some("4"));
        Ok(())
    }

    #[test]
    fn test_duplicate_attribute_overwrites() -> Result<()> {
        let cfg = parse("threads 4\nthreads 8\n")?;
        assert_eq!(cfg.attributes().get("threads"), Some("8"));
        Ok(())
    }

    #[test]
    fn test_duplicate_siblings_rejected() {
        assert!(parse("HANDLER h1 { DEVICE d { } DEVICE d { } }").is_err());
        assert!(parse("HANDLER h1 { }\nHANDLER h1 { }").is_err());
        assert!(parse(
            "TARGET_DRIVER iscsi { TARGET t { LUN 0 d1\nLUN 0 d2 } }"
        )
        .is_err());
    }

    #[test]
    fn test_unclosed_brace_cites_opening_line() {
        let text = "setup_id 1\nHANDLER vdisk_fileio {\n    DEVICE d1 {\n        filename /x\n    }\n";
        assert_eq!(parse_error_line(text), 2);
    }

    #[test]
    fn test_stray_close_brace() {
        assert_eq!(parse_error_line("setup_id 1\n}\n"), 2);
    }

    #[test]
    fn test_invalid_lun_number() {
        assert!(parse("TARGET_DRIVER iscsi { TARGET t { LUN abc d1 } }").is_err());
    }

    #[test]
    fn test_invalid_enabled_value() {
        assert!(parse("TARGET_DRIVER iscsi { enabled 2 }").is_err());
    }

    #[test]
    fn test_unknown_directive_in_device_group() {
        assert!(parse("DEVICE_GROUP dg { bogus 1 }").is_err());
    }

    #[test]
    fn test_lun_zero_is_ordinary() -> Result<()> {
        let cfg = parse("TARGET_DRIVER iscsi { TARGET t { LUN 0 d1\nLUN 255 d2 } }")?;
        let target = cfg.get_driver("iscsi")?.get_target("t")?;
        assert_eq!(target.get_lun(0).unwrap().device(), "d1");
        assert_eq!(target.get_lun(255).unwrap().device(), "d2");
        Ok(())
    }

    #[test]
    fn test_parse_never_panics_on_junk() {
        for junk in [
            "{",
            "}",
            "HANDLER",
            "HANDLER {",
            "HANDLER h {{}}",
            "TARGET_DRIVER d { TARGET }",
            "\"",
            "LUN 0",
            "DEVICE_GROUP { TARGET_GROUP }",
            "HANDLER h { DEVICE d { unclosed",
        ] {
            let _ = parse(junk);
        }
    }

    #[test]
    fn test_serialize_round_trip() -> Result<()> {
        let text = r#"
setup_id 0x42
HANDLER vdisk_blockio {
    DEVICE vol1 {
        filename /dev/zvol/tank/vol1
        read_only 1
    }
}
TARGET_DRIVER iscsi {
    enabled 1
    IncomingUser "joe secret"
    TARGET iqn.x:t1 {
        enabled 0
        LUN 0 vol1 read_only=1
        GROUP g1 {
            INITIATOR iqn.y:ini1
            LUN 1 vol1
        }
    }
}
DEVICE_GROUP dg {
    DEVICE vol1
    TARGET_GROUP tgA {
        group_id 7
        TARGET iqn.x:t1 {
            rel_tgt_id 3
            preferred 1
        }
    }
}
"#;
        let first = parse(text)?;
        let second = parse(&to_conf_string(&first))?;
        assert_eq!(second, first);
        Ok(())
    }
}
