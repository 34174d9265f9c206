//! Quote balancing, so multi-sentence dialogue is spoken as one unit.

#[derive(Debug, Default)]
struct QuoteState {
    straight_double_open: bool,
    curly_double: usize,
    single: usize,
}

impl QuoteState {
    fn scan(text: &str) -> Self {
        let mut state = Self::default();
        let chars: Vec<char> = text.chars().collect();

        for (i, &c) in chars.iter().enumerate() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            match c {
                '"' => state.straight_double_open = !state.straight_double_open,
                '“' => state.curly_double += 1,
                '”' => state.curly_double = state.curly_double.saturating_sub(1),
                '‘' => state.single += 1,
                '\'' | '’' => state.single_quote(c, prev, next),
                _ => {}
            }
        }
        state
    }

    fn single_quote(&mut self, c: char, prev: Option<char>, next: Option<char>) {
        let alnum = |ch: Option<char>| ch.is_some_and(char::is_alphanumeric);
        if alnum(prev) && alnum(next) {
            // contraction: don't, it's
            return;
        }
        if !alnum(prev) && alnum(next) {
            // ’ in opening position is an elision ('tis, ’90s) as often as a quote
            if c == '\'' {
                self.single += 1;
            }
            return;
        }
        // Closing position. With nothing open this is a possessive (students').
        self.single = self.single.saturating_sub(1);
    }

    fn is_open(&self) -> bool {
        self.straight_double_open || self.curly_double > 0 || self.single > 0
    }
}

/// Whether `text` leaves a double or single quotation open.
pub fn has_open_quote(text: &str) -> bool {
    QuoteState::scan(text).is_open()
}

/// Merge consecutive sentences while a quotation is open.
///
/// Merging stops once the accumulated text reaches `max_chars`, which keeps
/// a stray quote mark from swallowing the rest of the paragraph.
pub fn merge_quoted(sentences: Vec<String>, max_chars: usize) -> Vec<String> {
    let mut merged = Vec::with_capacity(sentences.len());
    let mut pending = String::new();

    for sentence in sentences {
        if pending.is_empty() {
            pending = sentence;
        } else {
            pending.push(' ');
            pending.push_str(&sentence);
        }

        if !has_open_quote(&pending) || pending.chars().count() >= max_chars {
            merged.push(std::mem::take(&mut pending));
        }
    }

    if !pending.is_empty() {
        merged.push(pending);
    }
    merged
}
