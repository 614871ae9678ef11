//! Meter-type specific transcription prompts

use umr_common::MeterType;

use super::TranscriptionHints;

/// Build the prompt sent alongside the image
pub fn build_prompt(hints: &TranscriptionHints) -> String {
    let mut prompt = String::with_capacity(1024);

    prompt.push_str(match hints.meter_type {
        MeterType::Water => {
            "You are analyzing a photo of a water meter. The digit wheels show whole \
             cubic meters (usually 4-5 digits, black on white)."
        }
        MeterType::Electric => {
            "You are analyzing a photo of an electricity meter. The register shows whole \
             kilowatt-hours."
        }
        MeterType::Gas => {
            "You are analyzing a photo of a gas meter. The digit wheels show whole \
             cubic meters."
        }
    });
    prompt.push_str(&format!(" The meter is named '{}' and its unit is {}.\n\n", hints.meter_name, hints.unit));

    prompt.push_str("Read these components:\n");
    prompt.push_str("1. digital_reading: the whole-unit digits as an integer. Ignore any red or differently coloured trailing wheel.\n");
    if hints.has_sub_unit_wheel {
        prompt.push_str(
            "2. sub_unit_reading: the single trailing wheel (often red) showing tenths of a unit, as one digit 0-9.\n",
        );
    } else {
        prompt.push_str("2. sub_unit_reading: this meter has no tenths wheel, use null.\n");
    }
    if hints.has_dial {
        prompt.push_str(
            "3. dial_reading: the analog dial with a needle, as a fraction of one unit between 0.000 and 0.999. \
             Note where the needle points between the numbered marks.\n",
        );
    } else {
        prompt.push_str("3. dial_reading: this meter has no analog dial, use null.\n");
    }

    prompt.push_str(
        "\nReturn ONLY a JSON object, no prose:\n\
         {\n\
         \x20 \"digital_reading\": <integer>,\n\
         \x20 \"sub_unit_reading\": <integer 0-9 or null>,\n\
         \x20 \"dial_reading\": <float 0.000-0.999 or null>,\n\
         \x20 \"total_reading\": <digital_reading + sub_unit_reading * 0.1 + dial_reading>,\n\
         \x20 \"confidence\": \"high\" | \"medium\" | \"low\",\n\
         \x20 \"notes\": \"observations or concerns\"\n\
         }\n\n\
         If the display is unclear, give your best reading, explain why in notes and set confidence to \"low\".",
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hints(meter_type: MeterType, has_sub_unit_wheel: bool, has_dial: bool) -> TranscriptionHints {
        TranscriptionHints {
            meter_name: "test".into(),
            meter_type,
            unit: meter_type.default_unit().into(),
            has_sub_unit_wheel,
            has_dial,
        }
    }

    #[test]
    fn test_prompt_mentions_meter_kind_and_schema() {
        let prompt = build_prompt(&hints(MeterType::Electric, false, false));
        assert!(prompt.contains("electricity meter"));
        assert!(prompt.contains("kWh"));
        assert!(prompt.contains("\"total_reading\""));
        assert!(prompt.contains("no analog dial"));
    }

    #[test]
    fn test_prompt_describes_sub_unit_wheel() {
        let prompt = build_prompt(&hints(MeterType::Water, true, true));
        assert!(prompt.contains("tenths of a unit"));
        assert!(prompt.contains("analog dial with a needle"));
    }
}
