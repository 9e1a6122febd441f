use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;

use anyhow::Context;
use getopts::{Matches, Options};
use nix::{
    sys::wait::waitpid,
    unistd::{fork, ForkResult, Pid},
};

use crate::frontend::{write_to_stderr, write_to_stdout};

const DEFAULT_BSIZE: usize = 1024;
const MAX_BSIZE: usize = 1 << 20;

const USAGE: &str = "Uso: psplit [-l NLINES] [-b NBYTES] [-s BSIZE] [-p PROCS] [FILE1] [FILE2]...\n\
                     Opciones:\n\
                     -l NLINES Número máximo de líneas por fichero.\n\
                     -b NBYTES Número máximo de bytes por fichero.\n\
                     -s BSIZE  Tamaño en bytes de los bloques leídos de [FILEn] o stdin.\n\
                     -p PROCS  Número máximo de procesos simultáneos.\n\
                     -h        Ayuda\n";

enum SplitMode {
    Lines(u64),
    Bytes(u64),
    // Neither -l nor -b: the whole input goes to a single output file
    Whole,
}

// Splits each input (stdin when no files are given) into consecutive files
// named <input>0, <input>1, ... Option errors are user errors: message and
// return, the shell keeps going.
pub fn run_psplit(argv: &[String]) -> anyhow::Result<()> {
    let mut opts = Options::new();
    opts.optopt("l", "", "número máximo de líneas por fichero", "NLINES");
    opts.optopt("b", "", "número máximo de bytes por fichero", "NBYTES");
    opts.optopt("s", "", "tamaño de los bloques leídos", "BSIZE");
    opts.optopt("p", "", "número máximo de procesos simultáneos", "PROCS");
    opts.optflag("h", "", "ayuda");

    let matches = match opts.parse(&argv[1..]) {
        Ok(matches) => matches,
        Err(fail) => {
            return write_to_stderr(&format!("psplit: {}\n", fail));
        }
    };

    if matches.opt_present("h") {
        return write_to_stdout(USAGE);
    }

    let bsize = match positive_opt(&matches, "s") {
        Ok(None) => DEFAULT_BSIZE,
        Ok(Some(size)) if size as usize <= MAX_BSIZE => size as usize,
        _ => return write_to_stdout("psplit: Opción -s no válida\n"),
    };

    let lines = match positive_opt(&matches, "l") {
        Ok(lines) => lines,
        Err(()) => {
            return write_to_stdout(
                "psplit: Opción -l no válida, debe de establecer el número de lineas\n",
            );
        }
    };

    let bytes = match positive_opt(&matches, "b") {
        Ok(bytes) => bytes,
        Err(()) => {
            return write_to_stdout(
                "psplit: Opción -b no válida, debe de establecer un tamaño en bytes\n",
            );
        }
    };

    let procs = match positive_opt(&matches, "p") {
        Ok(procs) => procs,
        Err(()) => return write_to_stdout("psplit: Opción -p no válida\n"),
    };

    let mode = match (lines, bytes) {
        (Some(_), Some(_)) => return write_to_stdout("psplit: Opciones incompatibles\n"),
        (Some(lines), None) => SplitMode::Lines(lines),
        (None, Some(bytes)) => SplitMode::Bytes(bytes),
        (None, None) => SplitMode::Whole,
    };

    if matches.free.is_empty() {
        return split_stream(&mut io::stdin().lock(), "stdin", bsize, &mode);
    }

    match procs {
        Some(procs) => split_parallel(&matches.free, bsize, &mode, procs as usize),
        None => {
            for file in &matches.free {
                split_file(file, bsize, &mode)?;
            }
            Ok(())
        }
    }
}

// An absent option is fine; a present one must be a positive number.
fn positive_opt(matches: &Matches, name: &str) -> Result<Option<u64>, ()> {
    match matches.opt_str(name) {
        None => Ok(None),
        Some(text) => match text.parse::<u64>() {
            Ok(value) if value > 0 => Ok(Some(value)),
            _ => Err(()),
        },
    }
}

fn split_file(file: &str, bsize: usize, mode: &SplitMode) -> anyhow::Result<()> {
    let mut input = match File::open(file) {
        Ok(input) => input,
        Err(_) => {
            return write_to_stdout(&format!("psplit: no se puede abrir '{}'\n", file));
        }
    };

    split_stream(&mut input, file, bsize, mode)
}

// Circular pool of at most `procs` workers, one forked child per input
// file; the slot's previous occupant is reaped before it is reused.
fn split_parallel(
    files: &[String],
    bsize: usize,
    mode: &SplitMode,
    procs: usize,
) -> anyhow::Result<()> {
    let mut pool: Vec<Option<Pid>> = vec![None; procs];

    for (index, file) in files.iter().enumerate() {
        let slot = index % procs;
        if let Some(pid) = pool[slot].take() {
            waitpid(pid, None).context("waitpid psplit")?;
        }

        match unsafe { fork() }.context("fork psplit")? {
            ForkResult::Parent { child } => pool[slot] = Some(child),
            ForkResult::Child => {
                let status = match split_file(file, bsize, mode) {
                    Ok(()) => 0,
                    Err(err) => {
                        let _ = write_to_stderr(&format!("psplit: {:#}\n", err));
                        1
                    }
                };
                unsafe { libc::_exit(status) }
            }
        }
    }

    for pid in pool.into_iter().flatten() {
        waitpid(pid, None).context("waitpid psplit")?;
    }

    Ok(())
}

fn split_stream(
    input: &mut dyn Read,
    prefix: &str,
    bsize: usize,
    mode: &SplitMode,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; bsize];
    let mut sink = OutputSink::new(prefix);

    loop {
        let read = input.read(&mut buf).context("read")?;
        if read == 0 {
            break;
        }

        let mut chunk = &buf[..read];
        while !chunk.is_empty() {
            let taken = match mode {
                SplitMode::Whole => sink.write(chunk)?,
                SplitMode::Bytes(per_file) => sink.write_bytes_budget(chunk, *per_file)?,
                SplitMode::Lines(per_file) => sink.write_lines_budget(chunk, *per_file)?,
            };
            chunk = &chunk[taken..];
        }
    }

    sink.finish()
}

// Lazily rotating output target: files are only created once there is a
// byte to put in them, so empty input produces no files at all.
struct OutputSink<'a> {
    prefix: &'a str,
    index: usize,
    current: Option<File>,
    // lines or bytes still to be written into the current file
    budget: u64,
}

impl<'a> OutputSink<'a> {
    fn new(prefix: &'a str) -> Self {
        Self {
            prefix,
            index: 0,
            current: None,
            budget: 0,
        }
    }

    fn current_file(&mut self, budget: u64) -> anyhow::Result<&mut File> {
        if self.current.is_none() {
            let name = format!("{}{}", self.prefix, self.index);
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o700)
                .open(&name)
                .with_context(|| format!("open '{}'", name))?;
            self.index += 1;
            self.budget = budget;
            self.current = Some(file);
        }

        Ok(self.current.as_mut().expect("just created"))
    }

    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<usize> {
        let file = self.current_file(0)?;
        file.write_all(chunk).context("write")?;
        Ok(chunk.len())
    }

    fn write_bytes_budget(&mut self, chunk: &[u8], per_file: u64) -> anyhow::Result<usize> {
        self.current_file(per_file)?;
        let take = (self.budget.min(chunk.len() as u64)) as usize;

        let file = self.current.as_mut().expect("file is open");
        file.write_all(&chunk[..take]).context("write")?;

        self.budget -= take as u64;
        if self.budget == 0 {
            self.rotate()?;
        }

        Ok(take)
    }

    fn write_lines_budget(&mut self, chunk: &[u8], per_file: u64) -> anyhow::Result<usize> {
        self.current_file(per_file)?;

        // Take bytes until the current file's newline budget is spent
        let mut take = chunk.len();
        let mut exhausted = false;
        for (offset, byte) in chunk.iter().enumerate() {
            if *byte == b'\n' {
                self.budget -= 1;
                if self.budget == 0 {
                    take = offset + 1;
                    exhausted = true;
                    break;
                }
            }
        }

        let file = self.current.as_mut().expect("file is open");
        file.write_all(&chunk[..take]).context("write")?;

        if exhausted {
            self.rotate()?;
        }

        Ok(take)
    }

    fn rotate(&mut self) -> anyhow::Result<()> {
        if let Some(file) = self.current.take() {
            file.sync_all().context("fsync")?;
        }
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.rotate()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;

    fn args(argv: &[&str]) -> Vec<String> {
        argv.iter().map(|a| a.to_string()).collect()
    }

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("simplesh-psplit-{}-{}", std::process::id(), name))
    }

    fn cleanup(prefix: &PathBuf, parts: usize) {
        let _ = fs::remove_file(prefix);
        for i in 0..parts + 2 {
            let _ = fs::remove_file(format!("{}{}", prefix.display(), i));
        }
    }

    fn part(prefix: &PathBuf, i: usize) -> String {
        fs::read_to_string(format!("{}{}", prefix.display(), i)).expect("part should exist")
    }

    fn no_part(prefix: &PathBuf, i: usize) -> bool {
        !PathBuf::from(format!("{}{}", prefix.display(), i)).exists()
    }

    #[test]
    fn test_split_by_lines() {
        let input = scratch("lines");
        fs::write(&input, "l1\nl2\nl3\nl4\nl5\n").unwrap();

        let path = input.display().to_string();
        run_psplit(&args(&["psplit", "-l", "2", "-s", "16", &path])).unwrap();

        assert_eq!(part(&input, 0), "l1\nl2\n");
        assert_eq!(part(&input, 1), "l3\nl4\n");
        assert_eq!(part(&input, 2), "l5\n");
        assert!(no_part(&input, 3));

        cleanup(&input, 3);
    }

    #[test]
    fn test_split_by_lines_with_tiny_read_buffer() {
        let input = scratch("lines-tiny");
        fs::write(&input, "a\nbb\nccc\n").unwrap();

        let path = input.display().to_string();
        run_psplit(&args(&["psplit", "-l", "1", "-s", "2", &path])).unwrap();

        assert_eq!(part(&input, 0), "a\n");
        assert_eq!(part(&input, 1), "bb\n");
        assert_eq!(part(&input, 2), "ccc\n");
        assert!(no_part(&input, 3));

        cleanup(&input, 3);
    }

    #[test]
    fn test_split_by_lines_without_trailing_newline() {
        let input = scratch("lines-tail");
        fs::write(&input, "a\nb").unwrap();

        let path = input.display().to_string();
        run_psplit(&args(&["psplit", "-l", "1", &path])).unwrap();

        assert_eq!(part(&input, 0), "a\n");
        assert_eq!(part(&input, 1), "b");

        cleanup(&input, 2);
    }

    #[test]
    fn test_split_by_bytes() {
        let input = scratch("bytes");
        fs::write(&input, "0123456789").unwrap();

        let path = input.display().to_string();
        run_psplit(&args(&["psplit", "-b", "4", "-s", "3", &path])).unwrap();

        assert_eq!(part(&input, 0), "0123");
        assert_eq!(part(&input, 1), "4567");
        assert_eq!(part(&input, 2), "89");
        assert!(no_part(&input, 3));

        cleanup(&input, 3);
    }

    #[test]
    fn test_without_mode_copies_everything_to_one_file() {
        let input = scratch("whole");
        fs::write(&input, "todo junto\n").unwrap();

        let path = input.display().to_string();
        run_psplit(&args(&["psplit", &path])).unwrap();

        assert_eq!(part(&input, 0), "todo junto\n");
        assert!(no_part(&input, 1));

        cleanup(&input, 1);
    }

    #[test]
    fn test_empty_input_creates_no_files() {
        let input = scratch("empty");
        fs::write(&input, "").unwrap();

        let path = input.display().to_string();
        run_psplit(&args(&["psplit", "-l", "2", &path])).unwrap();

        assert!(no_part(&input, 0));

        cleanup(&input, 0);
    }

    #[test]
    fn test_incompatible_options_touch_nothing() {
        let input = scratch("incompat");
        fs::write(&input, "contenido\n").unwrap();

        let path = input.display().to_string();
        run_psplit(&args(&["psplit", "-l", "1", "-b", "1", &path])).unwrap();

        assert!(no_part(&input, 0));

        cleanup(&input, 0);
    }

    #[test]
    fn test_invalid_option_values_are_user_errors() {
        run_psplit(&args(&["psplit", "-s", "0"])).unwrap();
        run_psplit(&args(&["psplit", "-s", "1048577"])).unwrap();
        run_psplit(&args(&["psplit", "-l", "0"])).unwrap();
        run_psplit(&args(&["psplit", "-b", "nada"])).unwrap();
        run_psplit(&args(&["psplit", "-p", "0"])).unwrap();
    }

    #[test]
    fn test_missing_input_is_a_user_error() {
        run_psplit(&args(&["psplit", "-l", "1", "/no-existe-simplesh"])).unwrap();
    }

    #[test]
    fn test_parallel_workers_split_every_file() {
        let inputs: Vec<PathBuf> = (0..3).map(|i| scratch(&format!("par{}", i))).collect();
        for input in &inputs {
            fs::write(input, "x\ny\n").unwrap();
        }

        let paths: Vec<String> = inputs.iter().map(|p| p.display().to_string()).collect();
        let mut argv = args(&["psplit", "-l", "1", "-p", "2"]);
        argv.extend(paths);

        run_psplit(&argv).unwrap();

        for input in &inputs {
            assert_eq!(part(input, 0), "x\n");
            assert_eq!(part(input, 1), "y\n");
            cleanup(input, 2);
        }
    }
}
