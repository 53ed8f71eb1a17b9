use std::fmt::Write as _;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

const CURRENT_DATE_FORMAT: &str = "%A, %B %-d, %Y at %-I:%M:%S %p";

/// Frozen "now" embedded into one calendar prompt.
///
/// Taken once per invocation so relative dates in the task ("Friday night") resolve against
/// the same instant the prompt states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSnapshot {
    rendered: String,
}

impl ClockSnapshot {
    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    pub fn from_datetime<Tz>(datetime: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        Self {
            rendered: datetime.format(CURRENT_DATE_FORMAT).to_string(),
        }
    }

    pub fn from_naive(datetime: NaiveDateTime) -> Self {
        Self {
            rendered: datetime.format(CURRENT_DATE_FORMAT).to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: String,
}

impl Contact {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

const PREAMBLE: &str = "You are a thoughtful assistant that helps the user do tasks on their MacBook. \
Answer as concisely as possible for each response (e.g. don't be verbose). \
When it makes sense, use markdown syntax to output code, links, tables, etc. \
If outputting code, include the programming language. \
It is possible to interact with applications for the user via JavaScript, which will be executed through the \"osascript\" command. \
Use the examples below as a guide. \
ALWAYS include the \"sendReply\" function at the end of your response. This will send the response to the user.";

const CALENDAR_CONVENTIONS: &str = "Calendar conventions:
Monday = 0
...
Sunday = 6";

const EXAMPLE_DATE: &str = "Monday, February 20, 2023 at 4:11:25 PM";

const EXAMPLES: &[(&str, &str)] = &[
    (
        "invite subhash and kaushik to dinner on friday night",
        r#"let app = Application.currentApplication()
app.includeStandardAdditions = true
let Calendar = Application("Calendar")

let eventStart = app.currentDate()
let today = app.currentDate()
const startDate = eventStart.getDate() - today.getDay() + 5;
eventStart.setDate(startDate)
eventStart.setHours(17)
eventStart.setMinutes(0)
eventStart.setSeconds(0)
let eventEnd = new Date(eventStart.getTime())
eventEnd.setHours(18)

let projectCalendars = Calendar.calendars.whose({name: "Home"})
let projectCalendar = projectCalendars[0]
let event = Calendar.Event({summary: "Dinner with Subhash", startDate: eventStart, endDate: eventEnd})
projectCalendar.events.push(event)

event.attendees.push(Calendar.Attendee({email: "subhash@minion.ai"}))
event.attendees.push(Calendar.Attendee({email: "kaushik@minion.ai"}))

Calendar.reloadCalendars()

sendReply("Ok! I scheduled dinner for you on Friday at 5pm, and sent an invitation to Subhash and Kaushik.")"#,
    ),
    (
        "clear all events for this week",
        r#"let app = Application.currentApplication()
app.includeStandardAdditions = true
let Calendar = Application("Calendar")

let today = app.currentDate()
let startDate = new Date(today.getTime())
startDate.setDate(today.getDate() - today.getDay())
startDate.setHours(0)
startDate.setMinutes(0)
startDate.setSeconds(0)
let endDate = new Date(startDate.getTime())
endDate.setDate(startDate.getDate() + 6)
endDate.setHours(23)
endDate.setMinutes(59)
endDate.setSeconds(59)

let projectCalendars = Calendar.calendars.whose({name: "Home"})
let projectCalendar = projectCalendars[0]
let events = projectCalendar.events.whose({
	_and: [
		{ startDate: {_greaterThan: startDate }},
		{ endDate: {_lessThanEquals: endDate }}
	]})

events().forEach(event => {
  Calendar.delete(projectCalendar.events.byId(event.id()))
})

Calendar.reloadCalendars()

sendReply("Ok! I cleared all of your events for this week.")"#,
    ),
    (
        "invite subhash to dinner from thursday to the rest of the week",
        r#"let app = Application.currentApplication()
app.includeStandardAdditions = true
let Calendar = Application("Calendar")

let projectCalendars = Calendar.calendars.whose({name: "Home"})
let projectCalendar = projectCalendars[0]

// since today is monday and we want thursday through sunday, the index runs from 4 to 6
for (let i = 4; i <= 6; i++) {
  let today = app.currentDate()
  let eventStart = app.currentDate()
  const startDate = today.getDate() - today.getDay() + i;
  eventStart.setDate(startDate)
  eventStart.setHours(17)
  eventStart.setMinutes(0)
  eventStart.setSeconds(0)
  let eventEnd = new Date(eventStart.getTime())
  eventEnd.setHours(18)

  let event = Calendar.Event({summary: "Dinner with Subhash", startDate: eventStart, endDate: eventEnd})
  projectCalendar.events.push(event)
  event.attendees.push(Calendar.Attendee({email: "subhash@minion.ai"}))
}

Calendar.reloadCalendars()

sendReply("Ok! I scheduled dinner on Thursday, Friday, Saturday, and Sunday at 5pm. I've also sent an invitation to Subhash on all 4 days.")"#,
    ),
];

pub fn default_contacts() -> Vec<Contact> {
    vec![
        Contact::new("Tiffany Sun", "tiffanysun7@gmail.com"),
        Contact::new("Austin Wang", "austinpowers1258@gmail.com"),
        Contact::new("Lawrence Chen", "lawrence@minion.ai"),
        Contact::new("Alex Gravely", "alex@minion.ai"),
        Contact::new("Kaushik Patnaik", "kaushik@minion.ai"),
        Contact::new("Subhash Ramesh", "subhash@minion.ai"),
    ]
}

/// Renders the few-shot script-generation prompt.
///
/// The prompt ends inside an opened ```` ```js ```` fence, so the completion is bare script text
/// and the closing fence is the natural stop sequence.
pub fn render_calendar_prompt(task: &str, contacts: &[Contact], clock: &ClockSnapshot) -> String {
    let mut prompt = String::new();
    prompt.push_str(PREAMBLE);
    prompt.push_str("\n\nYour contacts:\n");
    for contact in contacts {
        let _ = writeln!(prompt, "- {}: {}", contact.name, contact.email);
    }
    prompt.push('\n');
    prompt.push_str(CALENDAR_CONVENTIONS);
    prompt.push('\n');

    for (index, (example_task, example_script)) in EXAMPLES.iter().enumerate() {
        let _ = write!(
            prompt,
            "\nExample {number}:\nTask: {example_task}\nContext:\napp.currentDate() == {EXAMPLE_DATE}\nOutput:\n```js\n{example_script}\n```\n",
            number = index + 1,
        );
    }

    let _ = write!(
        prompt,
        "\n\nBegin.\nTask: {task}\nContext:\napp.currentDate() == {clock}\nOutput:\n```js",
        task = task.trim(),
        clock = clock.as_str(),
    );
    prompt
}
