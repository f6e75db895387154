//! Handlebars rendering of mixin templates into the script directory

use crate::{Error, Result};
use handlebars::Handlebars;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Renders templates and writes them out per server
pub struct Renderer {
    handlebars: Handlebars<'static>,
    script_dir: PathBuf,
}

impl Renderer {
    /// A renderer writing below `script_dir`
    pub fn new(script_dir: impl Into<PathBuf>) -> Self {
        let mut handlebars = Handlebars::new();
        // Output is shell and YAML, never HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));

        Self {
            handlebars,
            script_dir: script_dir.into(),
        }
    }

    /// Root directory for rendered files
    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }

    /// Render `source` against `context`
    pub fn render(&self, name: &str, source: &str, context: &Value) -> Result<String> {
        self.handlebars
            .render_template(source, context)
            .map_err(|e| Error::render(name, e))
    }

    /// Render into `<script_dir>/<target_id>/<outfile>` with mode 0755
    ///
    /// An existing file is kept unless `overwrite` is set.
    pub fn cook(
        &self,
        name: &str,
        source: &str,
        context: &Value,
        target_id: Option<&str>,
        outfile: &str,
        overwrite: bool,
    ) -> Result<PathBuf> {
        let dir = match target_id {
            Some(id) => self.script_dir.join(id),
            None => self.script_dir.clone(),
        };
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(outfile);

        if path.is_file() && !overwrite {
            debug!("Keeping rendered {}", path.display());
            return Ok(path);
        }

        let rendered = self.render(name, source, context)?;
        std::fs::write(&path, rendered)?;
        set_executable(&path)?;
        debug!("Rendered {} -> {}", name, path.display());
        Ok(path)
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    if let Some(v) = h.param(0) {
        out.write(&serde_json::to_string(v.value()).unwrap_or_default())?;
    }
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let param = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&param.to_uppercase())?;
    Ok(())
}
