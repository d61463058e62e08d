use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Left-aligned text table. Empty cells render as `-` so columns stay readable.
pub struct Table {
    headers: Vec<&'static str>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&'static str]) -> Self {
        Self {
            headers: headers.to_vec(),
            rows: Vec::new(),
        }
    }

    pub fn with_rows(headers: &[&'static str], rows: Vec<Vec<String>>) -> Self {
        Self {
            headers: headers.to_vec(),
            rows,
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn render(&self) -> String {
        let cell = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };
        let body: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|r| {
                (0..self.headers.len())
                    .map(|i| cell(r.get(i).map(String::as_str).unwrap_or_default()))
                    .collect()
            })
            .collect();

        let widths: Vec<usize> = self
            .headers
            .iter()
            .enumerate()
            .map(|(i, h)| {
                body.iter()
                    .map(|r| r[i].chars().count())
                    .fold(h.len(), usize::max)
            })
            .collect();

        let dashes: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        let mut out = padded_line(self.headers.iter().copied(), &widths);
        out.push_str(&padded_line(dashes.iter().map(String::as_str), &widths));
        for r in &body {
            out.push_str(&padded_line(r.iter().map(String::as_str), &widths));
        }
        out
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }
}

fn padded_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let padded: Vec<String> = cells
        .zip(widths)
        .map(|(c, &w)| format!("{c:<w$}"))
        .collect();
    format!("{}\n", padded.join("  ").trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_align_and_blanks_become_dashes() {
        let mut t = Table::new(&["NAME", "REGION"]);
        t.push(vec!["develop".into(), String::new()]);
        t.push(vec!["live".into(), "eu-west-1".into()]);
        assert_eq!(
            t.render(),
            "NAME     REGION\n\
             -------  ---------\n\
             develop  -\n\
             live     eu-west-1\n"
        );
    }

    #[test]
    fn short_rows_are_padded() {
        let t = Table::with_rows(&["A", "B"], vec![vec!["x".into()]]);
        assert!(t.render().ends_with("x  -\n"));
    }
}
