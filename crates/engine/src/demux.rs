//! Stream Demultiplexer — separates `<think>...</think>` spans from visible
//! text in a character stream, with a fixed-size sliding-window delay so that
//! tag boundaries split across feed calls are still detected reliably.
//!
//! Ported from the sliding-window tokenizer this engine's reason-act loop was
//! distilled from: a two-state machine (`Outside`/`Inside`) that buffers
//! incoming characters, checks the buffer for a full open/close tag on every
//! character, and otherwise emits the oldest buffered character once the
//! buffer exceeds the window size.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemuxState {
    Outside,
    Inside,
}

/// One unit of demultiplexed output. Each carries a (possibly multi-char)
/// chunk: a single sliding character, or the full prefix preceding a tag
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    Visible(String),
    Think(String),
}

/// Sliding-window demultiplexer. One instance per executor run.
pub struct StreamDemultiplexer {
    window_size: usize,
    buffer: String,
    think_buffer: String,
    state: DemuxState,
}

impl StreamDemultiplexer {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            buffer: String::new(),
            think_buffer: String::new(),
            state: DemuxState::Outside,
        }
    }

    /// Feed one character, returning an event if the sliding window or a tag
    /// boundary produced output.
    pub fn feed(&mut self, ch: char) -> Option<DemuxEvent> {
        match self.state {
            DemuxState::Inside => self.process_in_think_tag(ch),
            DemuxState::Outside => self.process_normal_text(ch),
        }
    }

    /// Feed a whole string, returning every event produced in order.
    pub fn feed_str(&mut self, text: &str) -> Vec<DemuxEvent> {
        text.chars().filter_map(|c| self.feed(c)).collect()
    }

    fn process_in_think_tag(&mut self, ch: char) -> Option<DemuxEvent> {
        self.think_buffer.push(ch);

        if let Some(end_pos) = self.think_buffer.find(CLOSE_TAG) {
            let final_think_content = self.think_buffer[..end_pos].to_string();
            let remaining = self.think_buffer[end_pos + CLOSE_TAG.len()..].to_string();
            self.think_buffer.clear();
            self.state = DemuxState::Outside;
            if !remaining.is_empty() {
                self.buffer = remaining;
            }
            if !final_think_content.is_empty() {
                return Some(DemuxEvent::Think(final_think_content));
            }
            return None;
        }

        if self.think_buffer.chars().count() > self.window_size {
            let output_char = self.think_buffer.remove(0);
            return Some(DemuxEvent::Think(output_char.to_string()));
        }

        None
    }

    fn process_normal_text(&mut self, ch: char) -> Option<DemuxEvent> {
        self.buffer.push(ch);

        if let Some(start_pos) = self.buffer.find(OPEN_TAG) {
            let pre_content = self.buffer[..start_pos].to_string();
            self.buffer = self.buffer[start_pos + OPEN_TAG.len()..].to_string();
            self.state = DemuxState::Inside;
            if !pre_content.is_empty() {
                return Some(DemuxEvent::Visible(pre_content));
            }
            return None;
        }

        if self.buffer.chars().count() > self.window_size {
            let output_char = self.buffer.remove(0);
            return Some(DemuxEvent::Visible(output_char.to_string()));
        }

        None
    }

    /// Flush both buffers. Must be called once the input stream ends so that
    /// buffered-but-undecided characters are not lost.
    pub fn drain(&mut self) -> (Option<String>, Option<String>) {
        let visible = if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        };
        let think = if self.think_buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.think_buffer))
        };
        (visible, think)
    }
}

impl Default for StreamDemultiplexer {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &str, window: usize) -> (String, String) {
        let mut demux = StreamDemultiplexer::new(window);
        let mut visible = String::new();
        let mut think = String::new();
        for ev in demux.feed_str(input) {
            match ev {
                DemuxEvent::Visible(s) => visible.push_str(&s),
                DemuxEvent::Think(s) => think.push_str(&s),
            }
        }
        let (v, t) = demux.drain();
        if let Some(v) = v {
            visible.push_str(&v);
        }
        if let Some(t) = t {
            think.push_str(&t);
        }
        (visible, think)
    }

    #[test]
    fn plain_text_round_trips() {
        let (visible, think) = run("hello world, nothing hidden here", 10);
        assert_eq!(visible, "hello world, nothing hidden here");
        assert_eq!(think, "");
    }

    #[test]
    fn single_think_span_is_separated() {
        let (visible, think) = run("<think>reason</think>answer", 10);
        assert_eq!(visible, "answer");
        assert_eq!(think, "reason");
    }

    #[test]
    fn multiple_balanced_spans_all_removed() {
        let input = "a<think>one</think>b<think>two</think>c";
        let (visible, think) = run(input, 10);
        assert_eq!(visible, "abc");
        assert_eq!(think, "onetwo");
    }

    #[test]
    fn short_input_emits_nothing_until_drain() {
        let mut demux = StreamDemultiplexer::new(10);
        let events = demux.feed_str("short");
        assert!(events.is_empty());
        let (v, t) = demux.drain();
        assert_eq!(v.as_deref(), Some("short"));
        assert_eq!(t, None);
    }

    #[test]
    fn tag_split_across_feeds_is_still_detected() {
        let mut demux = StreamDemultiplexer::new(10);
        let mut events = Vec::new();
        for ch in "<thi".chars() {
            events.extend(demux.feed(ch));
        }
        for ch in "nk>reason</think>done".chars() {
            events.extend(demux.feed(ch));
        }
        let (v, _t) = demux.drain();
        let visible: String = events
            .iter()
            .filter_map(|e| match e {
                DemuxEvent::Visible(s) => Some(s.clone()),
                _ => None,
            })
            .chain(v)
            .collect();
        let think: String = events
            .iter()
            .filter_map(|e| match e {
                DemuxEvent::Think(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(visible, "done");
        assert_eq!(think, "reason");
    }
}
