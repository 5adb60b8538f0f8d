//! Shared output machinery for the read-only commands: a table for humans,
//! JSON lines or CSV for machines.

use std::io::Write as _;
use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write the output to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        let formatter = match &self.format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { table }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv,
        };
        Ok(Output { args: self, io, formatter })
    }
}

pub struct Output {
    args: Args,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Table { table: comfy_table::Table },
    Jsonl,
    Csv,
}

impl Output {
    /// Must be called before the first row; JSON lines carry field names in
    /// every record and ignore this.
    pub fn headers(&mut self, headers: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Table { table } => {
                table.set_header(headers);
            }
            Formatter::Jsonl => {}
            Formatter::Csv => {
                let cells: Vec<String> = headers.into_iter().map(String::from).collect();
                self.csv_row(&cells)?;
            }
        }
        Ok(())
    }

    /// Emit one record. The closures keep the unused representation from
    /// being built at all.
    pub fn row<R: serde::Serialize>(
        &mut self,
        cells: impl FnOnce() -> Vec<String>,
        record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Table { table } => {
                table.add_row(cells());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &record()).map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?;
            }
            Formatter::Csv => {
                let cells = cells();
                self.csv_row(&cells)?;
            }
        }
        Ok(())
    }

    /// Flush everything out; the table formats only now.
    pub fn finish(mut self) -> Result<(), Error> {
        if let Formatter::Table { table } = &self.formatter {
            writeln!(self.io, "{table}").map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }

    fn csv_row(&mut self, cells: &[String]) -> Result<(), Error> {
        // Worst case: every byte quoted, plus the surrounding quotes.
        let longest = cells.iter().map(|cell| cell.len()).max().unwrap_or(0);
        let mut buffer = vec![0; 2 + 2 * longest];
        let mut writer = csv_core::Writer::new();
        for (position, cell) in cells.iter().enumerate() {
            if position != 0 {
                let (WriteResult::InputEmpty, written) = writer.delimiter(&mut buffer) else {
                    unreachable!("delimiter always fits");
                };
                self.write_all(&buffer[..written])?;
            }
            let mut remaining = cell.as_bytes();
            loop {
                let (result, consumed, written) = writer.field(remaining, &mut buffer);
                self.write_all(&buffer[..written])?;
                remaining = &remaining[consumed..];
                if matches!(result, WriteResult::InputEmpty) {
                    break;
                }
            }
        }
        let (WriteResult::InputEmpty, written) = writer.terminator(&mut buffer) else {
            unreachable!("terminator always fits");
        };
        self.write_all(&buffer[..written])
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.io.write_all(bytes).map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.args.output {
            None => Error::WriteStdout(e),
            Some(path) => Error::WriteFile(e, path.clone()),
        }
    }
}
