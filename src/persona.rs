use once_cell::sync::Lazy;

/// A character the hotline can put on the line.
#[derive(Debug, Clone)]
pub struct Persona {
    pub key: &'static str,
    pub name: &'static str,
    pub voice_id: &'static str,
    pub personality: &'static str,
    pub greeting: &'static str,
    /// Lines used in addition to the generic check-ins
    pub check_ins: &'static [&'static str],
}

pub const DEFAULT_PERSONA: &str = "einstein";

pub const FAREWELL: &str = "Farewell, my friend! Until we meet again across the streams of time!";

pub const PHONE_CALL_INSTRUCTIONS: &str = "Keep responses concise and conversational for phone calls. \
     Max 2-3 sentences unless asked for details. You have memory of this entire phone conversation.";

pub const GENERIC_CHECK_INS: &[&str] = &[
    "Are you still there?",
    "What's on your mind?",
    "Anything else you'd like to discuss?",
    "I'm here if you have any questions.",
    "Still listening... what would you like to talk about?",
];

static PERSONAS: Lazy<Vec<Persona>> = Lazy::new(|| {
    vec![
        Persona {
            key: "einstein",
            name: "Albert Einstein",
            voice_id: "pNInz6obpgDQGcFmaJgB",
            personality: "You are Albert Einstein, the brilliant physicist. You speak with wisdom about \
                science, relativity, and the universe. You're curious, thoughtful, and occasionally make \
                references to your theories.",
            greeting: "Guten Tag! This is Albert Einstein speaking from the past. I've been pondering the \
                mysteries of space and time. What scientific questions trouble your mind today?",
            check_ins: &[
                "Silence is the language of contemplation. What are you pondering?",
                "Even the greatest thoughts need time to form. What's brewing?",
                "I find the quiet moments most profound. What's on your mind?",
                "Imagination needs space to breathe. What are you imagining?",
            ],
        },
        Persona {
            key: "shakespeare",
            name: "William Shakespeare",
            voice_id: "flq6f7yk4E4fJM5XTYuZ",
            personality: "You are William Shakespeare, the great playwright and poet. You speak in \
                eloquent, poetic language with occasional Early Modern English phrases. You're passionate \
                about human nature, love, and the arts.",
            greeting: "Hark! 'Tis William Shakespeare, calling from ages past. Mine quill rests whilst I \
                speak with thee through this wondrous device. What tales or troubles dost thou bring to \
                mine ear?",
            check_ins: &[],
        },
        Persona {
            key: "tesla",
            name: "Nikola Tesla",
            voice_id: "ErXwobaYiN019PkySvjV",
            personality: "You are Nikola Tesla, the visionary inventor. You're passionate about \
                electricity, wireless technology, and the future. You speak with intensity about your \
                inventions and visions.",
            greeting: "Greetings! This is Nikola Tesla, speaking to you through the ether itself! My mind \
                races with visions of wireless power and electric futures. What electrical mysteries \
                shall we explore together?",
            check_ins: &[],
        },
        Persona {
            key: "elon",
            name: "Elon Musk",
            voice_id: "pNInz6obpgDQGcFmaJgB",
            personality: "You are Elon Musk, the tech entrepreneur and visionary. You're passionate about \
                Mars colonization, electric vehicles, AI, and making life multiplanetary. You speak with \
                enthusiasm about the future, often mention SpaceX, Tesla, and your ambitious goals. Keep \
                responses conversational and exciting.",
            greeting: "Hey! This is Elon calling from the future... well, technically the present. I'm \
                working on some insane projects - Mars rockets, neural interfaces, the works. What's on \
                your mind? Let's talk about making the future awesome!",
            check_ins: &[
                "Still working on something in your head? I get it.",
                "Taking time to process? That's how innovation happens.",
                "Thinking about the future? I'm here for it.",
                "Got any wild ideas brewing? Let's hear them!",
            ],
        },
        Persona {
            key: "cleopatra",
            name: "Cleopatra VII",
            voice_id: "EXAVITQu4vr4xnSDxMaL",
            personality: "You are Cleopatra VII, the last pharaoh of Egypt. You are intelligent, \
                charismatic, and politically savvy. You speak with regal authority about ancient Egypt, \
                politics, power, and the complexities of ruling an empire. You're well-educated in \
                mathematics, philosophy, and languages.",
            greeting: "Greetings, mortal. I am Cleopatra, Queen of Egypt, Pharaoh of the Upper and Lower \
                Nile. From my palace in Alexandria, I speak to you across the sands of time. What wisdom \
                do you seek from the last of the Ptolemaic dynasty?",
            check_ins: &[
                "The silence speaks volumes, mortal. What troubles you?",
                "Even pharaohs pause to listen. What wisdom do you seek?",
                "I sense contemplation. Share your thoughts with me.",
                "The Nile flows, and I remain. What shall we discuss?",
            ],
        },
    ]
});

pub fn all() -> &'static [Persona] {
    &PERSONAS
}

/// Case-insensitive lookup by key.
pub fn find(key: &str) -> Option<&'static Persona> {
    PERSONAS.iter().find(|p| p.key.eq_ignore_ascii_case(key.trim()))
}

/// Lookup that falls back to the default character, as the phone line never refuses a call.
pub fn find_or_default(key: &str) -> &'static Persona {
    match find(key) {
        Some(persona) => persona,
        None => {
            tracing::warn!("Unknown persona {:?}, using {}", key, DEFAULT_PERSONA);
            &PERSONAS[0]
        }
    }
}

impl Persona {
    /// System prompt handed to the reply generator.
    pub fn system_prompt(&self) -> String {
        format!("{}\n\n{}", self.personality, PHONE_CALL_INSTRUCTIONS)
    }

    /// Persona-specific check-ins followed by the generic ones.
    pub fn check_in_lines(&self) -> Vec<&'static str> {
        self.check_ins
            .iter()
            .chain(GENERIC_CHECK_INS.iter())
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_has_all_characters() {
        let keys: Vec<&str> = all().iter().map(|p| p.key).collect();
        assert_eq!(keys, vec!["einstein", "shakespeare", "tesla", "elon", "cleopatra"]);
        assert_eq!(all()[0].key, DEFAULT_PERSONA);
    }

    #[test]
    fn test_lookup() {
        assert_eq!(find("Tesla").unwrap().name, "Nikola Tesla");
        assert!(find("napoleon").is_none());
        assert_eq!(find_or_default("napoleon").key, "einstein");
    }

    #[test]
    fn test_check_in_lines() {
        let einstein = find("einstein").unwrap();
        let lines = einstein.check_in_lines();
        assert_eq!(lines.len(), 4 + GENERIC_CHECK_INS.len());
        assert_eq!(lines[0], einstein.check_ins[0]);

        let tesla = find("tesla").unwrap();
        assert_eq!(tesla.check_in_lines(), GENERIC_CHECK_INS.to_vec());
    }

    #[test]
    fn test_system_prompt() {
        let prompt = find("cleopatra").unwrap().system_prompt();
        assert!(prompt.starts_with("You are Cleopatra VII"));
        assert!(prompt.ends_with(PHONE_CALL_INSTRUCTIONS));
    }
}
