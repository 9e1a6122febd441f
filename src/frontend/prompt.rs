use std::io;
use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use nix::unistd::{getcwd, getuid, User};

use super::write_to_stdout;

// Input provider: renders `<user>@<dir>> ` and hands back one line per
// call, None on end of file.
pub struct Prompt;

impl Prompt {
    pub fn new() -> Self {
        Self
    }

    pub fn read_line(&self) -> anyhow::Result<Option<String>> {
        self.render()?;

        let mut line = String::new();
        let read = io::stdin()
            .read_line(&mut line)
            .context("read from stdin")?;
        if read == 0 {
            return Ok(None);
        }

        Ok(Some(line))
    }

    fn render(&self) -> anyhow::Result<()> {
        let user = User::from_uid(getuid())
            .context("getpwuid")?
            .context("no passwd entry for current uid")?;
        let cwd = getcwd().context("getcwd")?;

        let text = prompt_string(&user.name, &cwd);
        write_to_stdout(&text.as_str().green().to_string())
    }
}

fn prompt_string(user: &str, cwd: &Path) -> String {
    let dir = cwd
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string());

    format!("{}@{}> ", user, dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_uses_basename_of_cwd() {
        assert_eq!(prompt_string("ana", Path::new("/home/ana")), "ana@ana> ");
        assert_eq!(
            prompt_string("ana", Path::new("/usr/local/bin")),
            "ana@bin> "
        );
    }

    #[test]
    fn test_prompt_at_filesystem_root() {
        assert_eq!(prompt_string("root", Path::new("/")), "root@/> ");
    }
}
