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
    /// Write the command output to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Format to write the command output in.
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
    #[error("could not serialize the record to JSON")]
    SerializeJson(#[source] serde_json::Error),
}

impl Args {
    pub fn open(self) -> Result<Output, Error> {
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
        Ok(Output::new(self, io))
    }
}

pub struct Output {
    args: Args,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table },
    Jsonl,
}

impl Output {
    fn new(args: Args, io: Box<dyn std::io::Write>) -> Self {
        let formatter = match &args.format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv {
                written_records: false,
            },
        };
        Output { args, io, formatter }
    }

    /// Column names for the formats that have a concept of them.
    pub fn headers(&mut self, headers: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                if *written_records {
                    panic!("csv headers must be written before any record!");
                }
                *written_records = true;
                self.csv_row(&headers)?;
            }
            Formatter::Table { comfy } => {
                comfy.set_header(headers);
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn csv_row<V: std::ops::Deref<Target = str>>(&mut self, values: &[V]) -> Result<(), Error> {
        // Sized so that a fully quoted field always fits in one write.
        let max_len = 2 + 2 * values.iter().map(|v| v.len()).max().unwrap_or(0);
        let mut output = vec![0; max_len];
        let mut writer = csv_core::Writer::new();
        for (index, value) in values.iter().enumerate() {
            // The delimiter goes between fields only. Writing it also closes
            // the quote of a preceding quoted field.
            if index > 0 {
                let (WriteResult::InputEmpty, ob) = writer.delimiter(&mut output) else {
                    panic!("csv writer ran out of buffer for a delimiter");
                };
                self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
            }
            let inp = value.as_bytes();
            let (WriteResult::InputEmpty, ib, ob) = writer.field(inp, &mut output) else {
                panic!("csv writer ran out of buffer for a field");
            };
            assert_eq!(value.len(), ib);
            self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
        }
        let (WriteResult::InputEmpty, ob) = writer.terminator(&mut output) else {
            panic!("csv writer ran out of buffer for a terminator");
        };
        self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))
    }

    /// Emit one record, rendered lazily for whichever format is active.
    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let values = table_row();
                self.csv_row(&values)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(table_row());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.args.output {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        match &self.formatter {
            Formatter::Csv { written_records: _ } => {}
            Formatter::Table { comfy } => {
                self.io
                    .write_fmt(format_args!("{comfy}\n"))
                    .map_err(|e| self.write_error(e))?;
            }
            Formatter::Jsonl => {}
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Sink {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .replace("\r\n", "\n")
        }
    }

    fn output(format: Format) -> (Output, Sink) {
        let sink = Sink::default();
        let args = Args {
            output: None,
            format,
        };
        (Output::new(args, Box::new(sink.clone())), sink)
    }

    #[test]
    fn csv_quotes_awkward_fields() {
        let (mut out, sink) = output(Format::Csv);
        out.headers(vec!["name", "value"]).unwrap();
        out.result(
            || vec!["ViCare Outside Temperature, home".to_string(), "11.4".to_string()],
            || serde_json::json!({}),
        )
        .unwrap();
        out.commit().unwrap();
        assert_eq!(
            sink.text(),
            "name,value\n\"ViCare Outside Temperature, home\",11.4\n"
        );
    }

    #[test]
    fn jsonl_writes_one_record_per_line() {
        let (mut out, sink) = output(Format::Jsonl);
        out.headers(vec!["ignored"]).unwrap();
        out.result(|| unreachable!(), || serde_json::json!({"value": 1})).unwrap();
        out.result(|| unreachable!(), || serde_json::json!({"value": 2})).unwrap();
        out.commit().unwrap();
        assert_eq!(sink.text(), "{\"value\":1}\n{\"value\":2}\n");
    }

    #[test]
    fn tables_render_on_commit() {
        let (mut out, sink) = output(Format::Table);
        out.headers(vec!["key"]).unwrap();
        out.result(|| vec!["outside_temperature".to_string()], || serde_json::json!({}))
            .unwrap();
        assert_eq!(sink.text(), "");
        out.commit().unwrap();
        let rendered = sink.text();
        assert!(rendered.contains("key"));
        assert!(rendered.contains("outside_temperature"));
        assert!(rendered.ends_with('\n'));
    }
}
